//! The rebuild engine (`spec.md` §4.E): a recipient half (outbound
//! connector, one task per donor) and a donor half (inbound scanner).

mod donor;
mod error;
mod recipient;

pub use donor::serve_rebuild_connection;
pub use error::RebuildError;
pub use recipient::run_recipient;
