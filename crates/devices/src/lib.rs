#![forbid(unsafe_code)]

pub mod pci;
