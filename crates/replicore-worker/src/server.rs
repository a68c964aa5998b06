//! Replication wire server of one worker.
//!
//! Accepts persistent controller connections, reads header/body frame
//! pairs, dispatches by request category and answers each exchange with a
//! response header plus a typed body. Responses on one connection are
//! written in the order the requests arrived.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::codec::FrameCodec;
use replicore_shared::protocol::{
    decode_body, encode_body, DeleteRequestBody, DirectorIndexRequestBody, DisposeRequestBody,
    DisposeResponseBody, DisposeStatus, EchoRequestBody, FindAllRequestBody, FindRequestBody,
    ManagementRequestBody, ManagementRequestKind, Priority, ProtoPerformance, ProtoStatus,
    ProtoStatusExt, QueuedRequestKind, ReplicationRequestBody, RequestCategory, RequestHeader,
    ResponseHeader, ServiceRequestKind, SqlRequestBody, OVERFLOW_CHUNK_ID,
};

use crate::context::WorkerContext;
use crate::processor::{ServiceState, StatusSnapshot, SubmitOutcome, WorkerProcessor};
use crate::requests::{
    delete::DeleteWorker, echo::EchoWorker, find::FindWorker, find_all::FindAllWorker,
    index::DirectorIndexWorker, replicate::ReplicateWorker, sql::SqlWorker, WorkerRequest,
    WorkerRequestKind,
};

/// The wire endpoint of one worker
#[derive(Debug)]
pub struct WorkerServer {
    ctx: Arc<WorkerContext>,
    processor: Arc<WorkerProcessor>,
}

/// One fully formed reply: a header and its typed body
struct Reply {
    header: ResponseHeader,
    body: Bytes,
}

impl Reply {
    fn error(id: &str, status: ProtoStatus, ext: ProtoStatusExt, error: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader {
                id: id.to_string(),
                status: status as i32,
                status_ext: ext as i32,
                error: error.into(),
                performance: None,
                target_performance: None,
                duplicate_request_id: String::new(),
            },
            body: Bytes::new(),
        }
    }

    fn from_snapshot(id: &str, snapshot: &StatusSnapshot, is_probe: bool) -> Self {
        Self {
            header: ResponseHeader {
                id: id.to_string(),
                status: snapshot.status as i32,
                status_ext: snapshot.status_ext as i32,
                error: snapshot.error.clone(),
                performance: Some(ProtoPerformance::from(snapshot.performance)),
                // A status probe echoes the original operation's record
                target_performance: is_probe
                    .then(|| ProtoPerformance::from(snapshot.performance)),
                duplicate_request_id: String::new(),
            },
            body: snapshot.body.clone(),
        }
    }
}

impl WorkerServer {
    pub fn new(ctx: Arc<WorkerContext>, processor: Arc<WorkerProcessor>) -> Arc<Self> {
        Arc::new(Self { ctx, processor })
    }

    /// Accept controller connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> ReplicaResult<()> {
        info!(worker = %self.ctx.worker.name, "wire server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "controller connected");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(%peer, "connection closed: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> ReplicaResult<()> {
        let mut framed = Framed::new(stream, FrameCodec);
        loop {
            let header_frame = match framed.next().await {
                Some(frame) => frame?,
                None => return Ok(()),
            };
            let body_frame = match framed.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(ReplicaError::protocol(
                        "connection closed between a header and its body",
                    ))
                }
            };
            let header: RequestHeader = decode_body(&header_frame)?;
            let reply = self.dispatch(&header, &body_frame).await;
            framed.send(encode_body(&reply.header)).await?;
            framed.send(reply.body).await?;
        }
    }

    async fn dispatch(&self, header: &RequestHeader, body: &[u8]) -> Reply {
        if header.instance_id != self.ctx.config.common.instance_id {
            warn!(
                id = %header.id,
                got = %header.instance_id,
                "instance identity mismatch"
            );
            return Reply::error(
                &header.id,
                ProtoStatus::Bad,
                ProtoStatusExt::InvalidParam,
                format!("instance identity mismatch: '{}'", header.instance_id),
            );
        }
        let category = match RequestCategory::try_from(header.category) {
            Ok(category) => category,
            Err(_) => {
                return Reply::error(
                    &header.id,
                    ProtoStatus::Bad,
                    ProtoStatusExt::InvalidParam,
                    format!("unknown request category {}", header.category),
                );
            }
        };
        match category {
            RequestCategory::Queued => self.dispatch_queued(header, body).await,
            RequestCategory::Request => self.dispatch_management(header, body).await,
            RequestCategory::Service => self.dispatch_service(header).await,
        }
    }

    async fn dispatch_queued(&self, header: &RequestHeader, body: &[u8]) -> Reply {
        let kind = match QueuedRequestKind::try_from(header.queued_type) {
            Ok(kind) => kind,
            Err(_) => {
                return Reply::error(
                    &header.id,
                    ProtoStatus::Bad,
                    ProtoStatusExt::InvalidParam,
                    format!("unknown queued request type {}", header.queued_type),
                );
            }
        };
        let built = match self.build_kind(kind, body) {
            Ok(built) => built,
            Err(reply) => {
                let mut reply = *reply;
                reply.header.id = header.id.clone();
                return reply;
            }
        };
        let priority = Priority::try_from(header.priority).unwrap_or_default();
        let request = WorkerRequest::new(header.id.clone(), priority, built);
        match self.processor.submit(request, header.timeout_sec) {
            SubmitOutcome::Submitted => {
                let snapshot = self
                    .processor
                    .check_status(&header.id)
                    .await
                    .expect("a just-submitted request is known");
                Reply::from_snapshot(&header.id, &snapshot, false)
            }
            SubmitOutcome::Duplicate(prior) => {
                let mut reply = match self.processor.check_status(&prior).await {
                    Some(snapshot) => Reply::from_snapshot(&header.id, &snapshot, false),
                    None => Reply::error(
                        &header.id,
                        ProtoStatus::Bad,
                        ProtoStatusExt::InvalidId,
                        "duplicate of a request that vanished",
                    ),
                };
                reply.header.status_ext = ProtoStatusExt::Duplicate as i32;
                reply.header.duplicate_request_id = prior;
                reply
            }
        }
    }

    /// Decode and validate a queued request body. Pre-condition violations
    /// are answered with `BAD` and never enqueued.
    fn build_kind(
        &self,
        kind: QueuedRequestKind,
        body: &[u8],
    ) -> Result<WorkerRequestKind, Box<Reply>> {
        let bad = |id: &str, ext: ProtoStatusExt, message: String| {
            Box::new(Reply::error(id, ProtoStatus::Bad, ext, message))
        };
        // The id is re-attached by the caller; body-level failures use an
        // empty id in logs only
        match kind {
            QueuedRequestKind::TestEcho => {
                let body: EchoRequestBody = decode_or(body)?;
                Ok(WorkerRequestKind::Echo(EchoWorker::new(
                    body.data,
                    body.delay_ms,
                )))
            }
            QueuedRequestKind::ReplicaCreate => {
                let body: ReplicationRequestBody = decode_or(body)?;
                self.check_chunk(body.chunk)?;
                self.check_database(&body.database)?;
                if self.ctx.config.worker(&body.worker_from).is_err() {
                    return Err(bad(
                        "",
                        ProtoStatusExt::InvalidParam,
                        format!("unknown source worker '{}'", body.worker_from),
                    ));
                }
                Ok(WorkerRequestKind::Replicate(ReplicateWorker::new(
                    body.database,
                    body.chunk,
                    body.worker_from,
                )))
            }
            QueuedRequestKind::ReplicaDelete => {
                let body: DeleteRequestBody = decode_or(body)?;
                self.check_chunk(body.chunk)?;
                self.check_database(&body.database)?;
                Ok(WorkerRequestKind::Delete(DeleteWorker::new(
                    body.database,
                    body.chunk,
                )))
            }
            QueuedRequestKind::ReplicaFind => {
                let body: FindRequestBody = decode_or(body)?;
                self.check_chunk(body.chunk)?;
                Ok(WorkerRequestKind::Find(FindWorker::new(
                    body.database,
                    body.chunk,
                    body.compute_check_sum,
                )))
            }
            QueuedRequestKind::ReplicaFindAll => {
                let body: FindAllRequestBody = decode_or(body)?;
                Ok(WorkerRequestKind::FindAll(FindAllWorker::new(body.database)))
            }
            QueuedRequestKind::Sql => {
                let body: SqlRequestBody = decode_or(body)?;
                Ok(WorkerRequestKind::Sql(SqlWorker::new(body)))
            }
            QueuedRequestKind::Index => {
                let body: DirectorIndexRequestBody = decode_or(body)?;
                self.check_chunk(body.chunk)?;
                self.check_database(&body.database)?;
                Ok(WorkerRequestKind::Index(DirectorIndexWorker::new(
                    body.database,
                    body.director_table,
                    body.chunk,
                    body.has_transactions,
                    body.transaction_id,
                    body.offset,
                )))
            }
        }
    }

    fn check_chunk(&self, chunk: u32) -> Result<(), Box<Reply>> {
        if chunk == OVERFLOW_CHUNK_ID {
            return Err(Box::new(Reply::error(
                "",
                ProtoStatus::Bad,
                ProtoStatusExt::InvalidParam,
                format!("the reserved overflow chunk {chunk} is not admitted"),
            )));
        }
        Ok(())
    }

    fn check_database(&self, database: &str) -> Result<(), Box<Reply>> {
        if self.ctx.config.database(database).is_err() {
            return Err(Box::new(Reply::error(
                "",
                ProtoStatus::Bad,
                ProtoStatusExt::InvalidDatabase,
                format!("unknown database '{database}'"),
            )));
        }
        Ok(())
    }

    async fn dispatch_management(&self, header: &RequestHeader, body: &[u8]) -> Reply {
        let kind = match ManagementRequestKind::try_from(header.management_type) {
            Ok(kind) => kind,
            Err(_) => {
                return Reply::error(
                    &header.id,
                    ProtoStatus::Bad,
                    ProtoStatusExt::InvalidParam,
                    format!("unknown management type {}", header.management_type),
                );
            }
        };
        match kind {
            ManagementRequestKind::Status | ManagementRequestKind::Track => {
                let body: ManagementRequestBody = match decode_body(body) {
                    Ok(body) => body,
                    Err(e) => {
                        return Reply::error(
                            &header.id,
                            ProtoStatus::Bad,
                            ProtoStatusExt::InvalidParam,
                            e.to_string(),
                        )
                    }
                };
                match self.processor.check_status(&body.target_id).await {
                    Some(snapshot) => Reply::from_snapshot(&header.id, &snapshot, true),
                    None => Reply::error(
                        &header.id,
                        ProtoStatus::Bad,
                        ProtoStatusExt::InvalidId,
                        format!("unknown request '{}'", body.target_id),
                    ),
                }
            }
            ManagementRequestKind::Stop => {
                let body: ManagementRequestBody = match decode_body(body) {
                    Ok(body) => body,
                    Err(e) => {
                        return Reply::error(
                            &header.id,
                            ProtoStatus::Bad,
                            ProtoStatusExt::InvalidParam,
                            e.to_string(),
                        )
                    }
                };
                match self.processor.stop_request(&body.target_id).await {
                    Some(snapshot) => Reply::from_snapshot(&header.id, &snapshot, true),
                    None => Reply::error(
                        &header.id,
                        ProtoStatus::Bad,
                        ProtoStatusExt::InvalidId,
                        format!("unknown request '{}'", body.target_id),
                    ),
                }
            }
            ManagementRequestKind::Dispose => {
                let body: DisposeRequestBody = match decode_body(body) {
                    Ok(body) => body,
                    Err(e) => {
                        return Reply::error(
                            &header.id,
                            ProtoStatus::Bad,
                            ProtoStatusExt::InvalidParam,
                            e.to_string(),
                        )
                    }
                };
                let ids = self
                    .processor
                    .dispose(&body.ids)
                    .into_iter()
                    .map(|(id, disposed)| DisposeStatus { id, disposed })
                    .collect();
                Reply {
                    header: ResponseHeader {
                        id: header.id.clone(),
                        status: ProtoStatus::Success as i32,
                        status_ext: ProtoStatusExt::None as i32,
                        error: String::new(),
                        performance: None,
                        target_performance: None,
                        duplicate_request_id: String::new(),
                    },
                    body: encode_body(&DisposeResponseBody { ids }),
                }
            }
        }
    }

    async fn dispatch_service(&self, header: &RequestHeader) -> Reply {
        let kind = match ServiceRequestKind::try_from(header.service_type) {
            Ok(kind) => kind,
            Err(_) => {
                return Reply::error(
                    &header.id,
                    ProtoStatus::Bad,
                    ProtoStatusExt::InvalidParam,
                    format!("unknown service type {}", header.service_type),
                );
            }
        };
        let with_requests = matches!(kind, ServiceRequestKind::Requests);
        match kind {
            ServiceRequestKind::Status | ServiceRequestKind::Requests => {}
            ServiceRequestKind::Suspend => {
                self.processor.set_service_state(ServiceState::Suspended).await;
            }
            ServiceRequestKind::Resume => {
                self.processor.set_service_state(ServiceState::Running).await;
            }
            ServiceRequestKind::Drain => {
                self.processor.set_service_state(ServiceState::Draining).await;
            }
        }
        let census = self.processor.census(with_requests).await;
        Reply {
            header: ResponseHeader {
                id: header.id.clone(),
                status: ProtoStatus::Success as i32,
                status_ext: ProtoStatusExt::None as i32,
                error: String::new(),
                performance: None,
                target_performance: None,
                duplicate_request_id: String::new(),
            },
            body: encode_body(&census),
        }
    }
}

fn decode_or<M: prost::Message + Default>(body: &[u8]) -> Result<M, Box<Reply>> {
    decode_body(body).map_err(|e| {
        Box::new(Reply::error(
            "",
            ProtoStatus::Bad,
            ProtoStatusExt::InvalidParam,
            e.to_string(),
        ))
    })
}
