//! Server-wide process table: every in-flight query is registered here for
//! the duration of its execution and surfaces in `SHOW PROCESSLIST`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use crate::session::SqlContext;
use crate::sql::{Column, Row, Schema, SqlType, Value};

/// Command kind attributed to a process entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    Query,
    Sleep,
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessCommand::Query => f.write_str("Query"),
            ProcessCommand::Sleep => f.write_str("Sleep"),
        }
    }
}

/// Progress of one named unit of work (a table scan, an index build).
#[derive(Debug, Clone, Default)]
pub struct TableProgress {
    pub name: String,
    pub done: i64,
    pub total: i64,
    pub partitions: HashMap<String, PartitionProgress>,
}

impl fmt::Display for TableProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.done, self.total)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionProgress {
    pub name: String,
    pub done: i64,
    pub total: i64,
}

impl fmt::Display for PartitionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.done, self.total)
    }
}

/// One running query.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub conn_id: u32,
    pub user: String,
    pub host: String,
    pub database: String,
    pub command: ProcessCommand,
    pub started: Instant,
    pub query: String,
    pub progress: HashMap<String, TableProgress>,
}

impl ProcessEntry {
    pub fn seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// The shared process table. Registration, deregistration, and snapshot
/// reads are serialized behind one lock.
#[derive(Debug, Default)]
pub struct ProcessList {
    procs: Mutex<HashMap<u32, ProcessEntry>>,
}

impl ProcessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the context's query. Must be matched by exactly one
    /// [`end_query`](Self::end_query) on every exit path.
    pub fn begin_query(&self, ctx: &SqlContext, query: &str) {
        let session = ctx.session();
        let entry = ProcessEntry {
            conn_id: ctx.conn_id(),
            user: session.user().to_string(),
            host: session.host().to_string(),
            database: session.database(),
            command: ProcessCommand::Query,
            started: Instant::now(),
            query: query.to_string(),
            progress: HashMap::new(),
        };
        self.procs.lock().unwrap().insert(ctx.conn_id(), entry);
    }

    pub fn end_query(&self, ctx: &SqlContext) {
        self.procs.lock().unwrap().remove(&ctx.conn_id());
    }

    /// Point-in-time snapshot of all entries.
    pub fn processes(&self) -> Vec<ProcessEntry> {
        let mut procs: Vec<_> = self.procs.lock().unwrap().values().cloned().collect();
        procs.sort_by_key(|p| p.conn_id);
        procs
    }

    pub fn len(&self) -> usize {
        self.procs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_table_progress(&self, conn_id: u32, name: &str, total: i64) {
        if let Some(entry) = self.procs.lock().unwrap().get_mut(&conn_id) {
            entry.progress.insert(
                name.to_string(),
                TableProgress {
                    name: name.to_string(),
                    done: 0,
                    total,
                    partitions: HashMap::new(),
                },
            );
        }
    }

    pub fn update_table_progress(&self, conn_id: u32, name: &str, delta: i64) {
        if let Some(entry) = self.procs.lock().unwrap().get_mut(&conn_id) {
            if let Some(p) = entry.progress.get_mut(name) {
                p.done += delta;
            }
        }
    }

    pub fn add_partition_progress(&self, conn_id: u32, table: &str, partition: &str, total: i64) {
        if let Some(entry) = self.procs.lock().unwrap().get_mut(&conn_id) {
            if let Some(p) = entry.progress.get_mut(table) {
                p.partitions.insert(
                    partition.to_string(),
                    PartitionProgress {
                        name: partition.to_string(),
                        done: 0,
                        total,
                    },
                );
            }
        }
    }

    pub fn update_partition_progress(&self, conn_id: u32, table: &str, partition: &str, delta: i64) {
        if let Some(entry) = self.procs.lock().unwrap().get_mut(&conn_id) {
            if let Some(p) = entry.progress.get_mut(table) {
                if let Some(pp) = p.partitions.get_mut(partition) {
                    pp.done += delta;
                }
            }
        }
    }
}

/// Result schema of `SHOW PROCESSLIST`.
pub fn process_list_schema() -> Schema {
    vec![
        Column::new("Id", SqlType::Int64).not_null(),
        Column::new("User", SqlType::LongText).not_null(),
        Column::new("Host", SqlType::LongText).not_null(),
        Column::new("db", SqlType::LongText),
        Column::new("Command", SqlType::LongText).not_null(),
        Column::new("Time", SqlType::Int64).not_null(),
        Column::new("State", SqlType::LongText).not_null(),
        Column::new("Info", SqlType::LongText).not_null(),
    ]
}

/// Materialize the process table as `SHOW PROCESSLIST` rows.
pub fn process_list_rows(list: &ProcessList) -> Vec<Row> {
    list.processes()
        .into_iter()
        .map(|proc| {
            let mut status: Vec<String> = Vec::new();
            let mut names: Vec<&String> = proc.progress.keys().collect();
            names.sort();

            for name in names {
                let progress = &proc.progress[name];
                let mut children: Vec<String> =
                    progress.partitions.values().map(|p| p.to_string()).collect();
                children.sort();
                status.push(tree_print(&format!("\n{progress}"), &children));
            }

            if status.is_empty() && proc.command == ProcessCommand::Query {
                status.push("running".to_string());
            }

            let db = if proc.database.is_empty() {
                Value::Null
            } else {
                Value::Str(proc.database.clone())
            };

            vec![
                Value::Int64(proc.conn_id as i64),
                Value::Str(proc.user.clone()),
                Value::Str(proc.host.clone()),
                db,
                Value::Str(proc.command.to_string()),
                Value::Int64(proc.seconds() as i64),
                Value::Str(status.concat()),
                Value::Str(proc.query.clone()),
            ]
        })
        .collect()
}

fn tree_print(node: &str, children: &[String]) -> String {
    let mut out = String::with_capacity(node.len() + 16 * children.len());
    out.push_str(node);
    out.push('\n');
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        out.push_str(if last { " └─ " } else { " ├─ " });
        out.push_str(child);
        out.push('\n');
    }
    out
}
