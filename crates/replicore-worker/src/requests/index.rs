//! Director-index extraction of one chunk.
//!
//! The client streams the extraction: each request carries a byte offset
//! into the worker-side scan and receives the next slice together with the
//! total size, re-issuing requests until it holds everything.

use replicore_shared::errors::ReplicaError;
use replicore_shared::protocol::{DirectorIndexResponseBody, ProtoStatusExt};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
pub struct DirectorIndexWorker {
    pub database: String,
    pub director_table: String,
    pub chunk: u32,
    pub has_transactions: bool,
    pub transaction_id: u32,
    pub offset: u64,
    response: DirectorIndexResponseBody,
}

impl DirectorIndexWorker {
    pub fn new(
        database: String,
        director_table: String,
        chunk: u32,
        has_transactions: bool,
        transaction_id: u32,
        offset: u64,
    ) -> Self {
        Self {
            database,
            director_table,
            chunk,
            has_transactions,
            transaction_id,
            offset,
            response: DirectorIndexResponseBody::default(),
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        let database = ctx.config.database(&self.database)?;
        if database.director_table != self.director_table {
            return Err(ExecError::with(
                ProtoStatusExt::InvalidParam,
                ReplicaError::invalid_argument(format!(
                    "'{}' is not the director table of database '{}'",
                    self.director_table, self.database
                )),
            ));
        }
        let transaction_id = self.has_transactions.then_some(self.transaction_id);
        let data = ctx
            .sql
            .director_index(&self.database, &self.director_table, self.chunk, transaction_id)
            .map_err(|e| ExecError::with(ProtoStatusExt::SqlError, e))?;

        let total_bytes = data.len() as u64;
        if self.offset > total_bytes {
            return Err(ExecError::with(
                ProtoStatusExt::InvalidParam,
                ReplicaError::invalid_argument(format!(
                    "offset {} beyond the {total_bytes} byte extraction",
                    self.offset
                )),
            ));
        }
        let slice_len = ctx.config.common.request_buf_size_bytes;
        let begin = self.offset as usize;
        let end = (begin + slice_len).min(data.len());
        self.response = DirectorIndexResponseBody {
            data: data[begin..end].to_vec(),
            total_bytes,
        };
        Ok(ExecState::Done)
    }

    pub fn response(&self) -> DirectorIndexResponseBody {
        self.response.clone()
    }
}
