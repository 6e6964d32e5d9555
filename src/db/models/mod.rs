pub mod anomaly;
pub mod attendance;
pub mod code;
pub mod session;

pub use anomaly::{AccountLock, AnomalyRecord, AnomalyType, PresenceFix};
pub use attendance::AttendanceRecord;
pub use code::{CodeState, OneTimeCode};
pub use session::{Geofence, LockState, Session, SessionInfo, SessionOptions};
