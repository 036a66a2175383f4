use fleetwarden_shared::rpc::{ListRuntimeReply, ListRuntimeRequest, ListWarnReply, ListWarnRequest};
use fleetwarden_shared::{RuntimeLog, WarnLog};
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::database::unix_now;
use crate::entity::{node_infos, runtime_logs, warn_logs};
use crate::error::{ServiceError, ServiceResult};
use crate::pagination::fetch_page;

const MAX_READ_BATCH: usize = 50;
const RUNTIME_QUEUE: usize = 64;

/// Warning and audit log store.
#[derive(Clone)]
pub struct LogService {
    db: DatabaseConnection,
    runtime_tx: mpsc::Sender<RuntimeLog>,
}

/// Drains queued runtime log records into the database.
pub struct RuntimeLogWriter {
    db: DatabaseConnection,
    rx: mpsc::Receiver<RuntimeLog>,
}

impl LogService {
    pub fn new(db: DatabaseConnection) -> (Self, RuntimeLogWriter) {
        let (runtime_tx, rx) = mpsc::channel(RUNTIME_QUEUE);
        let writer = RuntimeLogWriter { db: db.clone(), rx };
        (Self { db, runtime_tx }, writer)
    }

    /// Queues an audit record without waiting for the insert.
    pub fn record_runtime(&self, record: RuntimeLog) {
        if let Err(e) = self.runtime_tx.try_send(record) {
            log::warn!("runtime log dropped: {}", e);
        }
    }

    pub async fn create_runtime_logs(&self, logs: Vec<RuntimeLog>) -> ServiceResult<()> {
        insert_runtime_logs(&self.db, logs).await
    }

    pub async fn list_runtime(&self, req: &ListRuntimeRequest) -> ServiceResult<ListRuntimeReply> {
        let mut select = runtime_logs::Entity::find().order_by_asc(runtime_logs::Column::Id);
        if req.start_time > 0 && req.start_time < req.end_time {
            select = select.filter(
                runtime_logs::Column::CreatedAt.between(req.start_time, req.end_time),
            );
        }
        if req.node_id > 0 {
            select = select.filter(runtime_logs::Column::NodeId.eq(req.node_id));
        }
        if req.event_module > 0 {
            select = select.filter(runtime_logs::Column::EventModule.eq(req.event_module));
        }

        let (pager, rows) = fetch_page(&self.db, select, req.page_size, req.page_no).await?;
        Ok(ListRuntimeReply {
            page: pager.info(),
            logs: rows.into_iter().map(to_runtime_log).collect(),
        })
    }

    /// Inserts warnings and bumps each node's unread counter atomically.
    pub async fn create_warn_logs(&self, logs: Vec<WarnLog>) -> ServiceResult<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut per_node: BTreeMap<i64, i64> = BTreeMap::new();
        for l in &logs {
            *per_node.entry(l.node_id).or_default() += 1;
        }

        let now = unix_now();
        let rows: Vec<warn_logs::ActiveModel> = logs
            .into_iter()
            .map(|l| warn_logs::ActiveModel {
                node_id: Set(l.node_id),
                node_info: Set(l.node_info),
                event_type: Set(l.event_type),
                event_module: Set(l.event_module),
                container_id: Set(l.container_id),
                container_name: Set(l.container_name),
                detail: Set(l.detail),
                have_read: Set(false),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            })
            .collect();

        let txn = self.db.begin().await?;
        warn_logs::Entity::insert_many(rows).exec(&txn).await?;
        for (node_id, count) in per_node {
            node_infos::Entity::update_many()
                .col_expr(
                    node_infos::Column::UnreadWarn,
                    Expr::col(node_infos::Column::UnreadWarn).add(count),
                )
                .filter(node_infos::Column::Id.eq(node_id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Unread warnings only.
    pub async fn list_warn(&self, req: &ListWarnRequest) -> ServiceResult<ListWarnReply> {
        let mut select = warn_logs::Entity::find()
            .filter(warn_logs::Column::HaveRead.eq(false))
            .order_by_asc(warn_logs::Column::Id);
        if req.node_id > 0 {
            select = select.filter(warn_logs::Column::NodeId.eq(req.node_id));
        }
        if req.event_module > 0 {
            select = select.filter(warn_logs::Column::EventModule.eq(req.event_module));
        }

        let (pager, rows) = fetch_page(&self.db, select, req.page_size, req.page_no).await?;
        Ok(ListWarnReply {
            page: pager.info(),
            logs: rows.into_iter().map(to_warn_log).collect(),
        })
    }

    pub async fn read_warn(&self, ids: &[i64]) -> ServiceResult<()> {
        if ids.is_empty() || ids.len() > MAX_READ_BATCH {
            return Err(ServiceError::invalid(format!(
                "between 1 and {} ids per request",
                MAX_READ_BATCH
            )));
        }

        let txn = self.db.begin().await?;
        let unread = warn_logs::Entity::find()
            .filter(warn_logs::Column::Id.is_in(ids.to_vec()))
            .filter(warn_logs::Column::HaveRead.eq(false))
            .all(&txn)
            .await?;
        if unread.is_empty() {
            txn.commit().await?;
            return Ok(());
        }

        let mut per_node: BTreeMap<i64, i64> = BTreeMap::new();
        for r in &unread {
            *per_node.entry(r.node_id).or_default() += 1;
        }

        // only the rows counted above flip, so each warning decrements once
        warn_logs::Entity::update_many()
            .col_expr(warn_logs::Column::HaveRead, Expr::value(true))
            .col_expr(warn_logs::Column::UpdatedAt, Expr::value(unix_now()))
            .filter(warn_logs::Column::Id.is_in(unread.iter().map(|r| r.id)))
            .filter(warn_logs::Column::HaveRead.eq(false))
            .exec(&txn)
            .await?;
        for (node_id, count) in per_node {
            node_infos::Entity::update_many()
                .col_expr(
                    node_infos::Column::UnreadWarn,
                    Expr::col(node_infos::Column::UnreadWarn).sub(count),
                )
                .filter(node_infos::Column::Id.eq(node_id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }
}

impl RuntimeLogWriter {
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            let target = record.target.clone();
            if let Err(e) = insert_runtime_logs(&self.db, vec![record]).await {
                log::warn!("write runtime log target={} err={}", target, e);
            }
        }
        log::info!("runtime log writer stopped");
    }
}

async fn insert_runtime_logs(db: &DatabaseConnection, logs: Vec<RuntimeLog>) -> ServiceResult<()> {
    if logs.is_empty() {
        return Ok(());
    }
    let now = unix_now();
    let rows: Vec<runtime_logs::ActiveModel> = logs
        .into_iter()
        .map(|l| runtime_logs::ActiveModel {
            node_id: Set(l.node_id),
            node_info: Set(l.node_info),
            user_id: Set(l.user_id),
            event_module: Set(l.event_module),
            target: Set(l.target),
            detail: Set(l.detail),
            status_code: Set(l.status_code),
            error: Set(l.error),
            created_at: Set(if l.created_at > 0 { l.created_at } else { now }),
            ..Default::default()
        })
        .collect();
    runtime_logs::Entity::insert_many(rows).exec(db).await?;
    Ok(())
}

fn to_warn_log(m: warn_logs::Model) -> WarnLog {
    WarnLog {
        id: m.id,
        node_id: m.node_id,
        node_info: m.node_info,
        event_type: m.event_type,
        event_module: m.event_module,
        container_id: m.container_id,
        container_name: m.container_name,
        detail: m.detail,
        have_read: m.have_read,
        created_at: m.created_at,
        updated_at: m.updated_at,
    }
}

fn to_runtime_log(m: runtime_logs::Model) -> RuntimeLog {
    RuntimeLog {
        id: m.id,
        node_id: m.node_id,
        node_info: m.node_info,
        user_id: m.user_id,
        event_module: m.event_module,
        target: m.target,
        detail: m.detail,
        status_code: m.status_code,
        error: m.error,
        created_at: m.created_at,
    }
}
