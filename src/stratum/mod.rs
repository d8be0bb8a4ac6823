//! Stratum server (C4): listener, per-connection state machine, vardiff,
//! ban/flood control, job broadcast.

pub mod ban;
pub mod connection;
pub mod messages;
pub mod server;
pub mod vardiff;

pub use ban::{BanConfig, BanMap};
pub use connection::{Connection, ConnectionState};
pub use server::{AuthorizeFn, ExtraNonceCounter, StratumServer, SubmitFn, JOB_REBROADCAST_TIMEOUT};
pub use messages::notify_frame;
pub use vardiff::{VarDiffSettings, VarDiffTracker};
