use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use tessera_types::{
    Cell, CellId, CellPatch, Effect, EffectId, EffectKey, EffectParams, EffectSpec,
    GlobalEffectState, Grid, GridId, Occupancy, SessionToken, Timestamp,
};

use super::{next_publish_timestamp, validate_grid, StateStore, StoreError, StoreResult};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS grids (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    column_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cells (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    grid_id INTEGER NOT NULL REFERENCES grids(id),
    row_idx INTEGER NOT NULL,
    col_idx INTEGER NOT NULL,
    occupied INTEGER NOT NULL DEFAULT 0,
    effect_override INTEGER REFERENCES effects(id),
    assigned_text TEXT,
    claimed_by TEXT,
    updated_at INTEGER NOT NULL DEFAULT 0,
    UNIQUE (grid_id, row_idx, col_idx)
);

CREATE TABLE IF NOT EXISTS effects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    css_key TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS global_effect (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_effect TEXT NOT NULL,
    publish_timestamp INTEGER NOT NULL,
    params TEXT NOT NULL
);
";

const CELL_COLUMNS: &str =
    "id, grid_id, row_idx, col_idx, occupied, effect_override, assigned_text, claimed_by, updated_at";

/// Store backed by a single SQLite database.
///
/// The connection sits behind a mutex, so a claim's conditional `UPDATE`
/// is the only writer while it runs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))
    }
}

fn cell_from_row(row: &Row<'_>) -> rusqlite::Result<Cell> {
    let occupied: bool = row.get(4)?;
    Ok(Cell {
        id: CellId::new(row.get(0)?),
        grid_id: GridId::new(row.get(1)?),
        row: row.get(2)?,
        column: row.get(3)?,
        occupancy: if occupied {
            Occupancy::Occupied
        } else {
            Occupancy::Free
        },
        effect_override: row.get::<_, Option<u32>>(5)?.map(EffectId::new),
        assigned_text: row.get(6)?,
        claimed_by: row.get::<_, Option<String>>(7)?.map(SessionToken),
        updated_at: Timestamp::from_millis(row.get(8)?),
    })
}

fn grid_from_row(row: &Row<'_>) -> rusqlite::Result<Grid> {
    Ok(Grid {
        id: GridId::new(row.get(0)?),
        name: row.get(1)?,
        rows: row.get(2)?,
        columns: row.get(3)?,
    })
}

fn effect_from_row(row: &Row<'_>) -> rusqlite::Result<Effect> {
    Ok(Effect {
        id: EffectId::new(row.get(0)?),
        display_name: row.get(1)?,
        css_key: EffectKey::new(row.get::<_, String>(2)?),
        description: row.get(3)?,
    })
}

fn release_sql(conn: &Connection, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<usize> {
    let sql = format!(
        "UPDATE cells SET occupied = 0, effect_override = NULL, assigned_text = NULL,
                claimed_by = NULL, updated_at = ?1 WHERE {}",
        where_clause
    );
    Ok(conn.execute(&sql, args)?)
}

impl StateStore for SqliteStore {
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE cells SET occupied = 1, claimed_by = ?4
             WHERE grid_id = ?1 AND row_idx = ?2 AND col_idx = ?3 AND occupied = 0",
            params![grid.get(), row, column, claimant.0],
        )?;
        let existing: Option<(u32, bool)> = conn
            .query_row(
                "SELECT id, occupied FROM cells WHERE grid_id = ?1 AND row_idx = ?2 AND col_idx = ?3",
                params![grid.get(), row, column],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match (changed, existing) {
            (1, Some((id, _))) => Ok(CellId::new(id)),
            (_, Some(_)) => Err(StoreError::Conflict),
            (_, None) => Err(StoreError::NotFound(format!(
                "cell ({}, {}) in grid {}",
                row, column, grid
            ))),
        }
    }

    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult {
        let conn = self.lock()?;
        match release_sql(&conn, "id = ?2", params![now.as_millis(), cell.get()])? {
            0 => Err(StoreError::NotFound(format!("cell {}", cell))),
            _ => Ok(()),
        }
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM cells WHERE id = ?1", CELL_COLUMNS),
            params![cell.get()],
            cell_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("cell {}", cell)))
    }

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM cells WHERE grid_id = ?1 AND row_idx = ?2 AND col_idx = ?3",
                CELL_COLUMNS
            ),
            params![grid.get(), row, column],
            cell_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("cell ({}, {}) in grid {}", row, column, grid)))
    }

    fn read_global(&self) -> StoreResult<GlobalEffectState> {
        let conn = self.lock()?;
        let row: Option<(String, i64, String)> = conn
            .query_row(
                "SELECT current_effect, publish_timestamp, params FROM global_effect WHERE id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match row {
            None => Ok(GlobalEffectState::default()),
            Some((key, ts, params)) => Ok(GlobalEffectState {
                current_effect: EffectKey::new(key),
                publish_timestamp: Timestamp::from_millis(ts),
                params: serde_json::from_str::<EffectParams>(&params)?,
            }),
        }
    }

    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let previous: i64 = tx
            .query_row(
                "SELECT publish_timestamp FROM global_effect WHERE id = 1",
                [],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let mut stored = state.clone();
        stored.publish_timestamp =
            next_publish_timestamp(state.publish_timestamp, Timestamp::from_millis(previous));
        tx.execute(
            "INSERT OR REPLACE INTO global_effect (id, current_effect, publish_timestamp, params)
             VALUES (1, ?1, ?2, ?3)",
            params![
                stored.current_effect.as_str(),
                stored.publish_timestamp.as_millis(),
                serde_json::to_string(&stored.params)?
            ],
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn update_cells(
        &self,
        cells: &[CellId],
        patch: &CellPatch,
        now: Timestamp,
    ) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut matched = 0;
        for id in cells {
            if let Some(effect) = patch.effect_override {
                tx.execute(
                    "UPDATE cells SET effect_override = ?2 WHERE id = ?1",
                    params![id.get(), effect.map(EffectId::get)],
                )?;
            }
            if let Some(text) = &patch.assigned_text {
                tx.execute(
                    "UPDATE cells SET assigned_text = ?2 WHERE id = ?1",
                    params![id.get(), text],
                )?;
            }
            matched += tx.execute(
                "UPDATE cells SET updated_at = ?2 WHERE id = ?1",
                params![id.get(), now.as_millis()],
            )?;
        }
        tx.commit()?;
        Ok(matched)
    }

    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut matched = 0;
        for id in cells {
            matched += release_sql(&tx, "id = ?2", params![now.as_millis(), id.get()])?;
        }
        tx.commit()?;
        Ok(matched)
    }

    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: Option<u32> = tx
            .query_row("SELECT id FROM grids WHERE id = ?1", params![grid.get()], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("grid {}", grid)));
        }
        let occupied: i64 = tx.query_row(
            "SELECT COUNT(*) FROM cells WHERE grid_id = ?1 AND occupied = 1",
            params![grid.get()],
            |r| r.get(0),
        )?;
        release_sql(&tx, "grid_id = ?2", params![now.as_millis(), grid.get()])?;
        tx.commit()?;
        Ok(occupied as usize)
    }

    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid> {
        validate_grid(name, rows, columns)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO grids (name, row_count, column_count) VALUES (?1, ?2, ?3)",
            params![name, rows, columns],
        )?;
        let id = GridId::new(tx.last_insert_rowid() as u32);
        {
            let mut insert = tx.prepare(
                "INSERT INTO cells (grid_id, row_idx, col_idx) VALUES (?1, ?2, ?3)",
            )?;
            for row in 0..rows {
                for column in 0..columns {
                    insert.execute(params![id.get(), row, column])?;
                }
            }
        }
        tx.commit()?;
        Ok(Grid {
            id,
            name: name.to_string(),
            rows,
            columns,
        })
    }

    fn list_grids(&self) -> StoreResult<Vec<Grid>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, row_count, column_count FROM grids ORDER BY id")?;
        let grids = stmt
            .query_map([], grid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(grids)
    }

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>> {
        let conn = self.lock()?;
        let exists: Option<u32> = conn
            .query_row("SELECT id FROM grids WHERE id = ?1", params![grid.get()], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("grid {}", grid)));
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cells WHERE grid_id = ?1 ORDER BY row_idx, col_idx",
            CELL_COLUMNS
        ))?;
        let cells = stmt
            .query_map(params![grid.get()], cell_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cells)
    }

    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for spec in specs {
                tx.execute(
                    "INSERT INTO effects (display_name, css_key, description) VALUES (?1, ?2, ?3)
                     ON CONFLICT(css_key) DO UPDATE SET
                        display_name = excluded.display_name,
                        description = excluded.description",
                    params![spec.display_name, spec.css_key.as_str(), spec.description],
                )?;
            }
            tx.commit()?;
        }
        self.effects()
    }

    fn effects(&self) -> StoreResult<Vec<Effect>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, display_name, css_key, description FROM effects ORDER BY id")?;
        let effects = stmt
            .query_map([], effect_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(effects)
    }

    fn effect(&self, id: EffectId) -> StoreResult<Effect> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, display_name, css_key, description FROM effects WHERE id = ?1",
            params![id.get()],
            effect_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("effect {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use tessera_types::Rgb;

    #[test]
    fn claim_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let grid = store.insert_grid("Main", 2, 2).unwrap();
        let me = SessionToken::new();

        let id = store.claim_cell(grid.id, 1, 0, &me).unwrap();
        assert_eq!(
            store.claim_cell(grid.id, 1, 0, &SessionToken::new()),
            Err(StoreError::Conflict)
        );
        assert!(store.read_cell(id).unwrap().is_claimed_by(&me));
        assert!(matches!(
            store.claim_cell(grid.id, 9, 0, &me),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_claims_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("tessera.db")).unwrap());
        let grid = store.insert_grid("Main", 1, 1).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.claim_cell(grid.id, 0, 0, &SessionToken::new()))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn release_clears_admin_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let effects = store
            .upsert_effects(&[EffectSpec {
                display_name: "Apagón".into(),
                css_key: EffectKey::new("apagon"),
                description: String::new(),
            }])
            .unwrap();
        let id = store.claim_cell(grid.id, 0, 0, &SessionToken::new()).unwrap();
        let patch = CellPatch {
            effect_override: Some(Some(effects[0].id)),
            assigned_text: Some(Some("HOLA".into())),
        };
        assert_eq!(store.update_cells(&[id], &patch, Timestamp::from_millis(7)).unwrap(), 1);
        let cell = store.read_cell(id).unwrap();
        assert_eq!(cell.effect_override, Some(effects[0].id));
        assert_eq!(cell.updated_at, Timestamp::from_millis(7));

        store.release_cell(id, Timestamp::from_millis(8)).unwrap();
        let cell = store.read_cell(id).unwrap();
        assert!(cell.is_free());
        assert_eq!(cell.assigned_text, None);
        assert_eq!(cell.effect_override, None);
        assert_eq!(cell.claimed_by, None);
    }

    #[test]
    fn global_row_persists_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            assert!(store.read_global().unwrap().current_effect.is_idle());
            let mut state = GlobalEffectState {
                current_effect: EffectKey::new("parpadeo-custom"),
                publish_timestamp: Timestamp::from_millis(500),
                ..Default::default()
            };
            state.params.blink_colors = vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)];
            store.write_global(&state).unwrap();
            let again = store.write_global(&state).unwrap();
            assert_eq!(again.publish_timestamp, Timestamp::from_millis(501));
        }
        let store = SqliteStore::open(&path).unwrap();
        let global = store.read_global().unwrap();
        assert_eq!(global.publish_timestamp, Timestamp::from_millis(501));
        assert_eq!(global.params.blink_colors.len(), 2);
    }

    #[test]
    fn release_grid_counts_occupied() {
        let store = SqliteStore::open_in_memory().unwrap();
        let grid = store.insert_grid("Main", 2, 3).unwrap();
        store.claim_cell(grid.id, 0, 2, &SessionToken::new()).unwrap();
        assert_eq!(store.release_grid(grid.id, Timestamp::from_millis(3)).unwrap(), 1);
        assert_eq!(store.list_cells(grid.id).unwrap().len(), 6);
        assert!(store.release_grid(GridId::new(42), Timestamp::ZERO).is_err());
    }
}
