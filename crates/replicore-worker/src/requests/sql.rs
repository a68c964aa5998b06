//! Schema-maintenance operation against the worker's embedded query
//! service.

use replicore_shared::protocol::{ProtoStatusExt, SqlRequestBody, SqlResponseBody};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
pub struct SqlWorker {
    body: SqlRequestBody,
    response: SqlResponseBody,
}

impl SqlWorker {
    pub fn new(body: SqlRequestBody) -> Self {
        Self {
            body,
            response: SqlResponseBody::default(),
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        match ctx.sql.execute(&self.body) {
            Ok(response) => {
                self.response = response;
                Ok(ExecState::Done)
            }
            Err(e) => {
                self.response = SqlResponseBody {
                    error: e.to_string(),
                    ..SqlResponseBody::default()
                };
                Err(ExecError::with(ProtoStatusExt::SqlError, e))
            }
        }
    }

    pub fn response(&self) -> SqlResponseBody {
        self.response.clone()
    }
}
