pub mod backfill;
pub mod stream;
pub mod supervisor;

pub use backfill::{backfill_market, run_sweep, sweep_markets};
pub use stream::stream_market;
pub use supervisor::Supervisor;
