//! Modbus Transport + Register Cache (base spec §4.A, §4.B).

pub mod cache;
pub mod transport;

pub use cache::RegisterCache;
pub use transport::{Endpoint, Transport};
