mod error;
mod handlers;
mod router;
mod types;

pub use error::{err, ok, ApiResult};
pub use router::build_router;
pub use types::{AppState, CurrentTeacher, TEACHER_HEADER};
