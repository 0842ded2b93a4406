//! Subcommand implementations.
//!
//! Each command writes its result to the given writer, one JSON document per
//! line, so output can be piped into other tools.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use gateguard_core::{
    EntitySnapshot, EntityStore, GateEvent, GateGuard, GuardConfig, SqliteEntityStore,
    SqliteEventLedger, TaskStatus, TerminalWriteFilter, UpdateOutcome,
};
use serde_json::json;
use tracing::{info, warn};

/// Store, guard and write filter sharing one database file.
pub struct Backend {
    store: Arc<SqliteEntityStore>,
    guard: GateGuard<SqliteEntityStore, SqliteEventLedger>,
    filter: TerminalWriteFilter<SqliteEntityStore>,
}

impl Backend {
    pub fn open(config: &GuardConfig) -> Result<Self> {
        let database = &config.store.database;
        let store = Arc::new(
            SqliteEntityStore::open(database)
                .with_context(|| format!("entity store at {}", database.display()))?,
        );
        let ledger = Arc::new(
            SqliteEventLedger::open(database, config.ledger)
                .with_context(|| format!("event ledger at {}", database.display()))?,
        );
        Ok(Self {
            guard: GateGuard::new(Arc::clone(&store), ledger),
            filter: TerminalWriteFilter::new(Arc::clone(&store)),
            store,
        })
    }
}

pub fn seed(backend: &Backend, id: &str, status: TaskStatus, out: &mut impl Write) -> Result<()> {
    let snapshot = EntitySnapshot::new(id, status, Utc::now());
    backend
        .store
        .insert(&snapshot)
        .with_context(|| format!("failed to create entity {id}"))?;
    info!(id, %status, "seeded entity");
    writeln!(out, "{}", serde_json::to_string(&snapshot)?)?;
    Ok(())
}

pub async fn show(backend: &Backend, id: &str, out: &mut impl Write) -> Result<()> {
    let Some(snapshot) = backend.store.get(id).await? else {
        bail!("entity {id} not found");
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
    Ok(())
}

/// Processes every event in `path` (`-` reads stdin) in file order.
///
/// Undecodable lines are reported as rejected and leave no trace in the
/// store or ledger. A store or ledger failure aborts the run; events after
/// it are left for a later redelivery.
pub async fn apply(backend: &Backend, path: &Path, out: &mut impl Write) -> Result<()> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut applied = 0usize;
    let mut rejected = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match GateEvent::from_json(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping undecodable event");
                rejected += 1;
                let report = json!({
                    "applied": false,
                    "reason": format!("invalid event: {e}"),
                    "retryable": false,
                    "line": line_no,
                });
                writeln!(out, "{report}")?;
                continue;
            },
        };

        let outcome = backend
            .guard
            .process_event(&event)
            .await
            .with_context(|| format!("failed to process event {}", event.event_id))?;
        if outcome.applied {
            applied += 1;
        } else {
            rejected += 1;
        }
        writeln!(out, "{}", serde_json::to_string(&outcome)?)?;
    }

    info!(applied, rejected, "finished processing events");
    Ok(())
}

/// Direct status write through the terminal-state filter, one conditional
/// write per entity.
pub async fn set_status(
    backend: &Backend,
    ids: &[String],
    status: TaskStatus,
    out: &mut impl Write,
) -> Result<()> {
    let reports = backend.filter.bulk_set_status(ids, status).await?;
    for (id, report) in reports {
        let line = match report.outcome {
            UpdateOutcome::Committed(snapshot) => json!({
                "id": id,
                "committed": true,
                "status": snapshot.status,
                "version": snapshot.version,
                "strippedMarkers": report.stripped_markers,
            }),
            UpdateOutcome::VersionMismatch { actual } => json!({
                "id": id,
                "committed": false,
                "reason": format!("version changed to {actual} during write"),
            }),
            UpdateOutcome::Missing => json!({
                "id": id,
                "committed": false,
                "reason": "not found",
            }),
        };
        writeln!(out, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use gateguard_core::StoreConfig;
    use serde_json::Value;

    use super::*;

    fn backend(dir: &tempfile::TempDir) -> Backend {
        let config = GuardConfig {
            store: StoreConfig {
                database: dir.path().join("gateguard.db"),
            },
            ..GuardConfig::default()
        };
        Backend::open(&config).unwrap()
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_apply_reports_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        seed(&backend, "T", TaskStatus::InProgress, &mut io::sink()).unwrap();

        let events = dir.path().join("events.jsonl");
        let mut file = File::create(&events).unwrap();
        let ts = "2026-01-01T00:00:00Z";
        writeln!(
            file,
            r#"{{"eventId":"E1","targetId":"T","action":"challenge","createdAt":"{ts}"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"eventId":"E2","targetId":"T","action":"approve","createdAt":"{ts}"}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"eventId":"E1","targetId":"T","action":"challenge","createdAt":"{ts}"}}"#
        )
        .unwrap();
        drop(file);

        let mut out = Vec::new();
        apply(&backend, &events, &mut out).await.unwrap();
        let report = lines(&out);

        assert_eq!(report.len(), 3);
        assert_eq!(report[0]["applied"], true);
        assert_eq!(report[1]["applied"], false);
        assert_eq!(report[1]["line"], 3);
        assert_eq!(report[2]["reason"], "duplicate");

        let snapshot = backend.store.get("T").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Review);
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_set_status_reports_stripped_markers_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        seed(&backend, "T", TaskStatus::InProgress, &mut io::sink()).unwrap();
        backend
            .guard
            .process_event(&GateEvent::new(
                "T",
                gateguard_core::GateAction::Block,
                Utc::now(),
            ))
            .await
            .unwrap();

        let mut out = Vec::new();
        set_status(
            &backend,
            &["T".to_string(), "ghost".to_string()],
            TaskStatus::Done,
            &mut out,
        )
        .await
        .unwrap();
        let report = lines(&out);

        assert_eq!(report[0]["committed"], true);
        assert_eq!(report[0]["status"], "done");
        assert_eq!(
            report[0]["strippedMarkers"],
            json!(["adversary_gate.event_id", "adversary_gate.verdict"])
        );
        assert_eq!(report[1]["committed"], false);
        assert_eq!(report[1]["reason"], "not found");
    }

    #[tokio::test]
    async fn test_show_missing_entity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        assert!(show(&backend, "ghost", &mut io::sink()).await.is_err());
    }
}
