//! Test fixtures

mod fake_device;

pub use fake_device::{FakeDevice, loopback_service_config};
