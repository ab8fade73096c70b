// Test Modules
pub mod support;
