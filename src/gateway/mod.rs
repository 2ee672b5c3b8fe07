//! Exchange gateways: the trait the runner talks to, retry handling, a paper
//! trading simulator and a scriptable mock for tests

pub mod mock;
mod paper;
mod retry;
mod traits;

pub use paper::{PaperGateway, PaperPosition};
pub use retry::RetryPolicy;
pub use traits::ExchangeGateway;
