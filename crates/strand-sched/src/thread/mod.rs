//! Threading Model
//!
//! Every OS thread in Strand is created here.
//! - `ThreadProxy`: one named thread serving any number of schedulers
//! - `ThreadPoolBase`: a fixed batch of proxies attached together
//! - `StallingWorkerPool`: workers woken one at a time through a stalling queue

mod pool;
mod proxy;
mod stalling_pool;

pub use pool::*;
pub use proxy::*;
pub use stalling_pool::*;
