//! The persisted relational mirror (spec §6): a write-through SQLite copy of
//! the in-memory graph and trace log, used to rehydrate state on restart.
//! Read methods rebuild plain domain structs; the in-memory [`GraphStore`]
//! and [`TraceStore`] remain the source of truth while the engine is running.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::graph::{Capability, CapabilityFeatures, Edge, EdgeSource, EdgeType, ErrorKind, Tool, ToolFeatures};
use crate::trace::TraceRecord;

use super::migrations::apply_migrations;

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

fn edge_source_str(s: EdgeSource) -> &'static str {
    match s {
        EdgeSource::User => "user",
        EdgeSource::Learned => "learned",
    }
}

fn edge_source_from_str(s: &str) -> EdgeSource {
    match s {
        "user" => EdgeSource::User,
        _ => EdgeSource::Learned,
    }
}

fn edge_type_str(t: EdgeType) -> &'static str {
    match t {
        EdgeType::Data => "data",
        EdgeType::Control => "control",
        EdgeType::Sequence => "sequence",
        EdgeType::Contains => "contains",
        EdgeType::Uses => "uses",
    }
}

fn edge_type_from_str(s: &str) -> EdgeType {
    match s {
        "data" => EdgeType::Data,
        "control" => EdgeType::Control,
        "contains" => EdgeType::Contains,
        "uses" => EdgeType::Uses,
        _ => EdgeType::Sequence,
    }
}

fn error_kind_str(k: ErrorKind) -> &'static str {
    match k {
        ErrorKind::Timeout => "timeout",
        ErrorKind::Permission => "permission",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Validation => "validation",
        ErrorKind::Network => "network",
        ErrorKind::Unknown => "unknown",
    }
}

fn error_kind_from_str(s: &str) -> Option<ErrorKind> {
    match s {
        "timeout" => Some(ErrorKind::Timeout),
        "permission" => Some(ErrorKind::Permission),
        "not_found" => Some(ErrorKind::NotFound),
        "validation" => Some(ErrorKind::Validation),
        "network" => Some(ErrorKind::Network),
        "unknown" => Some(ErrorKind::Unknown),
        _ => None,
    }
}

/// Write-through mirror over a SQLite connection, matching the teacher's
/// single-writer `Mutex<Connection>` storage shape.
pub struct PersistenceMirror {
    conn: Mutex<Connection>,
}

impl PersistenceMirror {
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let dirs = ProjectDirs::from("dev", "gateway", "core")
                    .ok_or_else(|| GatewayError::StorageUnavailable("could not determine project directories".into()))?;
                let data_dir = dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("gateway.db")
            }
        };
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        apply_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        apply_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    pub fn upsert_tool(&self, tool: &Tool) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "INSERT INTO tool_schema (id, description, deprecated, usage_count, success_count, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                deprecated = excluded.deprecated,
                usage_count = excluded.usage_count,
                success_count = excluded.success_count,
                last_seen = excluded.last_seen",
            params![tool.id, tool.description, tool.deprecated, tool.usage_count, tool.success_count, tool.last_seen.to_rfc3339()],
        )?;
        if let Some(embedding) = &tool.embedding {
            conn.execute(
                "INSERT INTO tool_embedding (tool_id, embedding, dimensions, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tool_id) DO UPDATE SET embedding = excluded.embedding, dimensions = excluded.dimensions, updated_at = excluded.updated_at",
                params![tool.id, encode_embedding(embedding), embedding.len() as i64, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn upsert_capability(&self, cap: &Capability) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "INSERT INTO capability_schema (id, description, content_hash, hierarchy_level, usage_count, success_count, last_used, quarantined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                content_hash = excluded.content_hash,
                hierarchy_level = excluded.hierarchy_level,
                usage_count = excluded.usage_count,
                success_count = excluded.success_count,
                last_used = excluded.last_used,
                quarantined = excluded.quarantined",
            params![
                cap.id,
                cap.description,
                cap.content_hash,
                cap.hierarchy_level,
                cap.usage_count,
                cap.success_count,
                cap.last_used.map(|t| t.to_rfc3339()),
                cap.quarantined,
            ],
        )?;
        if let Some(embedding) = &cap.embedding {
            conn.execute(
                "INSERT INTO capability_embedding (capability_id, embedding, dimensions, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(capability_id) DO UPDATE SET embedding = excluded.embedding, dimensions = excluded.dimensions, updated_at = excluded.updated_at",
                params![cap.id, encode_embedding(embedding), embedding.len() as i64, Utc::now().to_rfc3339()],
            )?;
        }
        conn.execute("DELETE FROM capability_dependency WHERE capability_id = ?1", params![cap.id])?;
        for (position, member) in cap.members.iter().enumerate() {
            conn.execute(
                "INSERT INTO capability_dependency (capability_id, member_id, position) VALUES (?1, ?2, ?3)",
                params![cap.id, member, position as i64],
            )?;
        }
        Ok(())
    }

    pub fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "INSERT INTO tool_dependency (from_id, to_id, observed_count, confidence, source, edge_type, last_observed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(from_id, to_id) DO UPDATE SET
                observed_count = excluded.observed_count,
                confidence = excluded.confidence,
                source = excluded.source,
                last_observed = excluded.last_observed",
            params![
                edge.from,
                edge.to,
                edge.observed_count,
                edge.confidence,
                edge_source_str(edge.source),
                edge_type_str(edge.edge_type),
                edge.last_observed.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn append_trace(&self, record: &TraceRecord) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let context_json = serde_json::to_string(&record.context_tool_ids).map_err(|e| GatewayError::StorageUnavailable(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO workflow_execution
                (workflow_id, step_index, timestamp, intent_text, intent_embedding, context_tool_ids, candidate_id, success, duration_ms, error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.workflow_id.to_string(),
                record.step_index,
                record.timestamp.to_rfc3339(),
                record.intent_text,
                encode_embedding(&record.intent_embedding),
                context_json,
                record.candidate_id,
                record.success,
                record.duration_ms,
                record.error_kind.map(error_kind_str),
            ],
        )?;
        Ok(())
    }

    pub fn load_tools(&self) -> Result<Vec<Tool>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT t.id, t.description, t.deprecated, t.usage_count, t.success_count, t.last_seen, e.embedding
             FROM tool_schema t LEFT JOIN tool_embedding e ON e.tool_id = t.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let description: String = row.get(1)?;
            let deprecated: bool = row.get(2)?;
            let usage_count: u64 = row.get(3)?;
            let success_count: u64 = row.get(4)?;
            let last_seen: String = row.get(5)?;
            let embedding_bytes: Option<Vec<u8>> = row.get(6)?;
            Ok((id, description, deprecated, usage_count, success_count, last_seen, embedding_bytes))
        })?;

        let mut tools = Vec::new();
        for row in rows {
            let (id, description, deprecated, usage_count, success_count, last_seen, embedding_bytes) = row?;
            let mut tool = Tool::new(id, description);
            tool.deprecated = deprecated;
            tool.usage_count = usage_count;
            tool.success_count = success_count;
            tool.last_seen = DateTime::parse_from_rfc3339(&last_seen).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());
            tool.embedding = embedding_bytes.and_then(|b| decode_embedding(&b));
            tool.features = ToolFeatures::default();
            tools.push(tool);
        }
        Ok(tools)
    }

    pub fn load_capabilities(&self) -> Result<Vec<Capability>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.id, c.description, c.content_hash, c.hierarchy_level, c.usage_count, c.success_count,
                    c.last_used, c.quarantined, e.embedding
             FROM capability_schema c LEFT JOIN capability_embedding e ON e.capability_id = c.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let description: String = row.get(1)?;
            let content_hash: String = row.get(2)?;
            let hierarchy_level: u32 = row.get(3)?;
            let usage_count: u64 = row.get(4)?;
            let success_count: u64 = row.get(5)?;
            let last_used: Option<String> = row.get(6)?;
            let quarantined: bool = row.get(7)?;
            let embedding_bytes: Option<Vec<u8>> = row.get(8)?;
            Ok((id, description, content_hash, hierarchy_level, usage_count, success_count, last_used, quarantined, embedding_bytes))
        })?;

        let mut caps = Vec::new();
        for row in rows {
            let (id, description, content_hash, hierarchy_level, usage_count, success_count, last_used, quarantined, embedding_bytes) = row?;
            let mut cap = Capability::new(id.clone(), description, content_hash);
            cap.hierarchy_level = hierarchy_level;
            cap.usage_count = usage_count;
            cap.success_count = success_count;
            cap.last_used = last_used.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc));
            cap.quarantined = quarantined;
            cap.embedding = embedding_bytes.and_then(|b| decode_embedding(&b));
            cap.features = CapabilityFeatures::default();

            let mut member_stmt = conn.prepare(
                "SELECT member_id FROM capability_dependency WHERE capability_id = ?1 ORDER BY position ASC",
            )?;
            let members: Vec<String> = member_stmt
                .query_map(params![id], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            cap.members = members;
            caps.push(cap);
        }
        Ok(caps)
    }

    pub fn load_edges(&self) -> Result<Vec<Edge>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, observed_count, confidence, source, edge_type, last_observed FROM tool_dependency",
        )?;
        let rows = stmt.query_map([], |row| {
            let from: String = row.get(0)?;
            let to: String = row.get(1)?;
            let observed_count: u32 = row.get(2)?;
            let confidence: f32 = row.get(3)?;
            let source: String = row.get(4)?;
            let edge_type: String = row.get(5)?;
            let last_observed: String = row.get(6)?;
            Ok((from, to, observed_count, confidence, source, edge_type, last_observed))
        })?;

        let mut edges = Vec::new();
        for row in rows {
            let (from, to, observed_count, confidence, source, edge_type, last_observed) = row?;
            edges.push(Edge {
                from,
                to,
                observed_count,
                confidence,
                source: edge_source_from_str(&source),
                last_observed: DateTime::parse_from_rfc3339(&last_observed).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                edge_type: edge_type_from_str(&edge_type),
            });
        }
        Ok(edges)
    }

    pub fn load_recent_traces(&self, limit: usize) -> Result<Vec<TraceRecord>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT workflow_id, step_index, timestamp, intent_text, intent_embedding, context_tool_ids,
                    candidate_id, success, duration_ms, error_kind
             FROM workflow_execution ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let workflow_id: String = row.get(0)?;
            let step_index: u32 = row.get(1)?;
            let timestamp: String = row.get(2)?;
            let intent_text: String = row.get(3)?;
            let intent_embedding: Vec<u8> = row.get(4)?;
            let context_tool_ids: String = row.get(5)?;
            let candidate_id: String = row.get(6)?;
            let success: bool = row.get(7)?;
            let duration_ms: u64 = row.get(8)?;
            let error_kind: Option<String> = row.get(9)?;
            Ok((workflow_id, step_index, timestamp, intent_text, intent_embedding, context_tool_ids, candidate_id, success, duration_ms, error_kind))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (workflow_id, step_index, timestamp, intent_text, intent_embedding, context_tool_ids, candidate_id, success, duration_ms, error_kind) = row?;
            records.push(TraceRecord {
                workflow_id: Uuid::parse_str(&workflow_id).unwrap_or_else(|_| Uuid::nil()),
                step_index,
                timestamp: DateTime::parse_from_rfc3339(&timestamp).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                intent_text,
                intent_embedding: decode_embedding(&intent_embedding).unwrap_or_default(),
                context_tool_ids: serde_json::from_str(&context_tool_ids).unwrap_or_default(),
                candidate_id,
                success,
                duration_ms,
                error_kind: error_kind.and_then(|s| error_kind_from_str(&s)),
            });
        }
        records.reverse();
        Ok(records)
    }

    pub fn set_adaptive_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "INSERT INTO adaptive_config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_adaptive_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let value = conn
            .query_row("SELECT value FROM adaptive_config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }
}
