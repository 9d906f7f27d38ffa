use std::time::Duration;

use anyhow::{anyhow, Context};
use jobq_core::JobqConfig;
use jobq_queue::{parse_scheduled_at, DispatchOptions, JobFilter, QueueEngine};
use serde_json::{json, Value};

use crate::Command;

/// Run one operator command and return its `data` payload.
pub(crate) fn execute(
    engine: &QueueEngine,
    config: &JobqConfig,
    command: Command,
) -> anyhow::Result<Value> {
    match command {
        Command::Dispatch {
            job_type,
            payload,
            priority,
            max_attempts,
            at,
            delay,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut opts = DispatchOptions::default().with_priority(priority);
            if let Some(n) = max_attempts {
                opts = opts.with_max_attempts(n);
            }
            let job = match (at, delay) {
                (Some(at), _) => {
                    engine.schedule(&job_type, payload, parse_scheduled_at(&at)?, opts)?
                }
                (None, Some(secs)) => engine.delay(&job_type, payload, secs, opts)?,
                (None, None) => engine.dispatch(&job_type, payload, opts)?,
            };
            Ok(serde_json::to_value(job)?)
        }
        Command::List {
            status,
            job_type,
            limit,
            offset,
        } => {
            let jobs = engine.list_jobs(&JobFilter {
                status,
                job_type,
                limit,
                offset,
            })?;
            Ok(json!({ "jobs": jobs, "count": jobs.len() }))
        }
        Command::Show { id } => Ok(serde_json::to_value(engine.get_job(&id)?)?),
        Command::Types => Ok(json!({ "types": engine.job_types()? })),
        Command::Stats => Ok(serde_json::to_value(engine.get_stats()?)?),
        Command::Cancel { ids } => match ids.as_slice() {
            [id] => {
                engine.cancel_job(id)?;
                Ok(json!({ "id": id }))
            }
            _ => Ok(serde_json::to_value(engine.cancel_jobs(&ids)?)?),
        },
        Command::Retry { ids } => match ids.as_slice() {
            [id] => Ok(serde_json::to_value(engine.retry_job(id)?)?),
            _ => Ok(serde_json::to_value(engine.retry_jobs(&ids)?)?),
        },
        Command::Cleanup { days } => {
            let deleted = engine.cleanup(days)?;
            Ok(json!({ "deleted": deleted, "days": days }))
        }
        Command::Recover { timeout_secs } => {
            let secs = timeout_secs
                .or(config.worker.lease_timeout_secs)
                .ok_or_else(|| {
                    anyhow!("no lease timeout: pass --timeout-secs or set worker.lease_timeout_secs")
                })?;
            let recovered = engine.recover_stale(Duration::from_secs(secs))?;
            Ok(json!({
                "requeued": recovered.requeued,
                "failed": recovered.failed,
                "timeout_secs": secs,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobq_queue::{HandlerRegistry, Priority, SqliteJobStore};

    fn engine() -> QueueEngine {
        QueueEngine::new(
            Arc::new(SqliteJobStore::in_memory().unwrap()),
            Arc::new(HandlerRegistry::new()),
            JobqConfig::default().queue,
        )
    }

    fn dispatch(engine: &QueueEngine, job_type: &str) -> Value {
        execute(
            engine,
            &JobqConfig::default(),
            Command::Dispatch {
                job_type: job_type.into(),
                payload: r#"{"to":"a@b.com"}"#.into(),
                priority: Priority::HIGH,
                max_attempts: Some(2),
                at: None,
                delay: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn dispatch_then_show() {
        let engine = engine();
        let job = dispatch(&engine, "send_email");
        assert_eq!(job["type"], "send_email");
        assert_eq!(job["priority"], 10);
        assert_eq!(job["max_attempts"], 2);
        assert_eq!(job["status"], "pending");

        let id = job["id"].as_str().unwrap().to_string();
        let shown = execute(&engine, &JobqConfig::default(), Command::Show { id }).unwrap();
        assert_eq!(shown, job);
    }

    #[test]
    fn bad_payload_is_rejected() {
        let engine = engine();
        let err = execute(
            &engine,
            &JobqConfig::default(),
            Command::Dispatch {
                job_type: "t".into(),
                payload: "not json".into(),
                priority: Priority::NORMAL,
                max_attempts: None,
                at: None,
                delay: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn list_and_stats_report_counts() {
        let engine = engine();
        dispatch(&engine, "a");
        dispatch(&engine, "b");

        let listed = execute(
            &engine,
            &JobqConfig::default(),
            Command::List {
                status: None,
                job_type: Some("a".into()),
                limit: 10,
                offset: 0,
            },
        )
        .unwrap();
        assert_eq!(listed["count"], 1);

        let stats = execute(&engine, &JobqConfig::default(), Command::Stats).unwrap();
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["by_status"]["pending"], 2);
    }

    #[test]
    fn bulk_cancel_reports_failures() {
        let engine = engine();
        let id = dispatch(&engine, "a")["id"].as_str().unwrap().to_string();
        let result = execute(
            &engine,
            &JobqConfig::default(),
            Command::Cancel {
                ids: vec![id.clone(), "missing".into()],
            },
        )
        .unwrap();
        assert_eq!(result["succeeded"], json!([id]));
        assert_eq!(result["failed"][0][0], "missing");
    }

    #[test]
    fn recover_requires_a_timeout() {
        let engine = engine();
        let err = execute(
            &engine,
            &JobqConfig::default(),
            Command::Recover { timeout_secs: None },
        )
        .unwrap_err();
        assert!(err.to_string().contains("lease timeout"));

        let ok = execute(
            &engine,
            &JobqConfig::default(),
            Command::Recover {
                timeout_secs: Some(60),
            },
        )
        .unwrap();
        assert_eq!(ok["requeued"], 0);
    }
}
