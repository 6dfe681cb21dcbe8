//! Core operation types for writes against the ERP

use std::fmt;

use crate::api::client::ErpApi;
use crate::api::error::RpcError;
use crate::api::session::Session;
use crate::api::xmlrpc::{Record, RpcValue};

/// A one-to-many / many-to-many command embedded in a write payload
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `(0, 0, values)`: create a new line
    Create(Record),
    /// `(1, id, values)`: update an existing line
    Update(i64, Record),
    /// `(2, id, 0)`: delete a line
    Delete(i64),
    /// `(6, 0, ids)`: replace the whole relation set
    Set(Vec<i64>),
}

impl Command {
    pub fn to_rpc(&self) -> RpcValue {
        let (code, id, payload) = match self {
            Command::Create(values) => (0, 0, RpcValue::Struct(values.clone())),
            Command::Update(id, values) => (1, *id, RpcValue::Struct(values.clone())),
            Command::Delete(id) => (2, *id, RpcValue::Int(0)),
            Command::Set(ids) => (6, 0, RpcValue::from(ids.clone())),
        };
        RpcValue::Array(vec![RpcValue::Int(code), RpcValue::Int(id), payload])
    }

    /// Encode a list of commands as a field value
    pub fn list(commands: &[Command]) -> RpcValue {
        RpcValue::Array(commands.iter().map(Command::to_rpc).collect())
    }
}

/// A single planned write
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Create a record, lines included
    Create { entity: String, values: Record },
    /// Update one record with a partial payload
    Write { entity: String, id: i64, values: Record },
    /// Invoke a state-transition action on one record
    Action { entity: String, id: i64, method: String },
}

/// What executing an [`Operation`] produced
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Created(i64),
    Written(i64),
    Acted(i64),
}

impl OperationResult {
    pub fn record_id(&self) -> i64 {
        match self {
            OperationResult::Created(id)
            | OperationResult::Written(id)
            | OperationResult::Acted(id) => *id,
        }
    }
}

impl Operation {
    pub fn create(entity: impl Into<String>, values: Record) -> Self {
        Self::Create {
            entity: entity.into(),
            values,
        }
    }

    pub fn write(entity: impl Into<String>, id: i64, values: Record) -> Self {
        Self::Write {
            entity: entity.into(),
            id,
            values,
        }
    }

    pub fn action(entity: impl Into<String>, id: i64, method: impl Into<String>) -> Self {
        Self::Action {
            entity: entity.into(),
            id,
            method: method.into(),
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            Operation::Create { entity, .. }
            | Operation::Write { entity, .. }
            | Operation::Action { entity, .. } => entity,
        }
    }

    pub fn operation_type(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Write { .. } => "write",
            Operation::Action { .. } => "action",
        }
    }

    /// Run the operation through a supervised session
    pub async fn execute<A: ErpApi>(
        &self,
        session: &mut Session<A>,
    ) -> Result<OperationResult, RpcError> {
        match self {
            Operation::Create { entity, values } => {
                let id = session.create(entity, values.clone()).await?;
                Ok(OperationResult::Created(id))
            }
            Operation::Write { entity, id, values } => {
                session.write(entity, &[*id], values.clone()).await?;
                Ok(OperationResult::Written(*id))
            }
            Operation::Action { entity, id, method } => {
                session.action(entity, method, &[*id]).await?;
                Ok(OperationResult::Acted(*id))
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create { entity, values } => {
                write!(f, "create {} {}", entity, RpcValue::Struct(values.clone()))
            }
            Operation::Write { entity, id, values } => {
                write!(f, "write {}#{} {}", entity, id, RpcValue::Struct(values.clone()))
            }
            Operation::Action { entity, id, method } => {
                write!(f, "call {}#{}.{}()", entity, id, method)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        let mut values = Record::new();
        values.insert("quantity".to_string(), RpcValue::Int(2));

        assert_eq!(
            Command::Create(values.clone()).to_rpc(),
            RpcValue::Array(vec![
                RpcValue::Int(0),
                RpcValue::Int(0),
                RpcValue::Struct(values.clone())
            ])
        );
        assert_eq!(
            Command::Update(7, values.clone()).to_rpc(),
            RpcValue::Array(vec![
                RpcValue::Int(1),
                RpcValue::Int(7),
                RpcValue::Struct(values)
            ])
        );
        assert_eq!(
            Command::Delete(9).to_rpc(),
            RpcValue::Array(vec![RpcValue::Int(2), RpcValue::Int(9), RpcValue::Int(0)])
        );
        assert_eq!(
            Command::Set(vec![3, 4]).to_rpc(),
            RpcValue::Array(vec![
                RpcValue::Int(6),
                RpcValue::Int(0),
                RpcValue::from(vec![3i64, 4])
            ])
        );
    }

    #[test]
    fn test_operation_accessors() {
        let op = Operation::action("account.move", 12, "action_post");
        assert_eq!(op.entity(), "account.move");
        assert_eq!(op.operation_type(), "action");
        assert_eq!(op.to_string(), "call account.move#12.action_post()");
        assert_eq!(OperationResult::Acted(12).record_id(), 12);
    }
}
