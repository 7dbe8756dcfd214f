pub mod config;
pub mod constants;
pub mod core;
pub mod http;
pub mod native;
pub mod stubs;

#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod test_utils;
