//! CAS 2.0 / 3.0 service ticket validation and single logout.

pub mod client;
pub mod config;
pub mod response;

pub use client::CasClient;
pub use config::{CasClientConfig, CasProtocol};
pub use response::{parse_service_response, CasAssertion};
