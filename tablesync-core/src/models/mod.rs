mod operation;
mod row;

pub use operation::{Attempt, Operation, OperationKind};
pub use row::{strip_system_properties, Payload, RemoteRow, Row, Version, WireError};
