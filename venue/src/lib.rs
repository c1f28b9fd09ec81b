pub mod client;
pub mod codec;
pub mod constants;
pub mod driver;
pub mod executor;
pub mod gate;
pub mod logger;
pub mod oracle;
pub mod retry;
pub mod risk;
pub mod snapshot;
pub mod types;
pub mod vault;

pub use client::*;
pub use codec::*;
pub use constants::*;
pub use driver::*;
pub use executor::*;
pub use gate::*;
pub use logger::*;
pub use oracle::*;
pub use retry::*;
pub use risk::*;
pub use snapshot::*;
pub use types::*;
pub use vault::*;
