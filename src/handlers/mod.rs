//! HTTP request handlers.

mod vms;

pub use vms::{create_vm, delete_vm, get_vm, metrics_scrape, stats};
