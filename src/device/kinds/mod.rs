//! Concrete device kind implementations, each self-registering into the
//! `inventory` table via `DeviceKindDescriptor`.

mod disk;
mod gpu;
mod infiniband;
mod nic;
mod proxy;
mod tpm;
mod unix_block;
mod unix_char;
mod usb;
