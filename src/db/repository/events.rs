use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::{StoredEvent, TraceEvent};

/// Append one trace event; the returned row id is its stream event id.
pub fn append_run_event(
    conn: &Connection,
    run_id: &str,
    event: &TraceEvent,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO run_events (run_id, ts, type, step, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id,
            event.ts,
            event.event_type.as_str(),
            event.step,
            serde_json::to_string(event)?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Events of one run with `id > after_id`, in append order.
pub fn list_run_events(
    conn: &Connection,
    run_id: &str,
    after_id: i64,
) -> Result<Vec<StoredEvent>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, data_json FROM run_events WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![run_id, after_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, data)| {
            Ok(StoredEvent {
                id,
                run_id: run_id.to_string(),
                event: serde_json::from_str(&data)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::insert_run;
    use crate::db::sqlite::open_memory_database;
    use crate::models::{EventType, Language, Run, RunInput};

    fn run_id(conn: &Connection) -> String {
        let run = Run::new(RunInput::for_case("case_000042", Language::En));
        insert_run(conn, &run).unwrap();
        run.run_id
    }

    #[test]
    fn events_are_listed_in_append_order() {
        let conn = open_memory_database().unwrap();
        let id = run_id(&conn);
        let a = append_run_event(&conn, &id, &TraceEvent::new(EventType::StepStarted).step("triage")).unwrap();
        let b = append_run_event(&conn, &id, &TraceEvent::new(EventType::StepCompleted).step("triage")).unwrap();
        let c = append_run_event(&conn, &id, &TraceEvent::new(EventType::Finalized)).unwrap();
        assert!(a < b && b < c);

        let events = list_run_events(&conn, &id, 0).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::StepStarted, EventType::StepCompleted, EventType::Finalized]
        );
        assert_eq!(list_run_events(&conn, &id, b).unwrap().len(), 1);
    }

    #[test]
    fn events_are_scoped_to_their_run() {
        let conn = open_memory_database().unwrap();
        let first = run_id(&conn);
        let second = run_id(&conn);
        append_run_event(&conn, &first, &TraceEvent::new(EventType::StepStarted)).unwrap();
        assert!(list_run_events(&conn, &second, 0).unwrap().is_empty());
    }

    #[test]
    fn events_cannot_be_rewritten() {
        let conn = open_memory_database().unwrap();
        let id = run_id(&conn);
        append_run_event(&conn, &id, &TraceEvent::new(EventType::StepStarted)).unwrap();
        assert!(conn.execute("UPDATE run_events SET type = 'finalized'", []).is_err());
        assert!(conn.execute("DELETE FROM run_events", []).is_err());
    }

    #[test]
    fn unknown_run_violates_foreign_key() {
        let conn = open_memory_database().unwrap();
        assert!(append_run_event(&conn, "ghost", &TraceEvent::new(EventType::StepStarted)).is_err());
    }
}
