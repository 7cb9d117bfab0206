//! SQLite-backed store.
//!
//! Each level's groups and each view's summaries live in a shared
//! table, discriminated by the level name and view name columns. Group
//! keys and member lists are stored as JSON text; see the codec
//! functions in [`super`].

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, ToSql};
use rusqlite_migration::{Migrations, M};

use crate::errors::{Reraise, Result};
use crate::level::Level;
use crate::merge::Group;
use crate::model::{DocId, RawArea, StoredArea, Summary, Timestamp, ViewKind};

use super::{
    decode_area, decode_group, decode_key, encode_area, encode_key, encode_members, AreaFilter,
    Store,
};

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            // `last_modified` is NULL until the tagger stamps the
            // document.
            M::up(
                "CREATE TABLE areas ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 doc_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 body TEXT NOT NULL, \
                 last_modified INTEGER \
                 ) STRICT",
            ),
            M::up("CREATE INDEX areas_by_last_modified ON areas (last_modified)"),
            M::up(
                "CREATE TABLE groups ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 level TEXT NOT NULL, \
                 group_key TEXT NOT NULL, \
                 members TEXT NOT NULL, \
                 last_modified INTEGER NOT NULL, \
                 PRIMARY KEY (level, group_key) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE summaries ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 view TEXT NOT NULL, \
                 level TEXT NOT NULL, \
                 group_key TEXT NOT NULL, \
                 area_count INTEGER NOT NULL CHECK (area_count > 0), \
                 pop_sum INTEGER NOT NULL CHECK (pop_sum >= 0), \
                 avg_pop INTEGER NOT NULL CHECK (avg_pop >= 0), \
                 last_modified INTEGER NOT NULL, \
                 PRIMARY KEY (view, level, group_key) \
                 ) STRICT",
            ),
            // There is only ever one row.
            M::up(
                "CREATE TABLE app_meta ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 id INTEGER PRIMARY KEY CHECK (id = 1), \
                 last_loaded_time INTEGER NOT NULL \
                 ) STRICT",
            ),
            // The state level selects changed city summaries by time.
            M::up(
                "CREATE INDEX summaries_by_last_modified \
                 ON summaries (view, level, last_modified)",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

#[test]
fn time_selected_tables_are_indexed() {
    let store = SqliteStore::open_in_memory().unwrap();
    let found: Vec<(String, String)> = store
        .conn
        .prepare(
            "SELECT tbl_name, name FROM sqlite_master \
             WHERE type = 'index' AND sql IS NOT NULL \
             ORDER BY name",
        )
        .unwrap()
        .query_map((), |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    let expected = vec![
        ("areas".to_owned(), "areas_by_last_modified".to_owned()),
        ("summaries".to_owned(), "summaries_by_last_modified".to_owned()),
    ];
    assert_eq!(found, expected);
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")
        .reraise("error setting store pragmas")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .reraise("error setting store pragmas")?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .reraise("error setting store pragmas")?;
    get_migrations()
        .to_latest(conn)
        .reraise("error migrating store schema")
}

/// A store in a single SQLite database file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path` and bring its schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!("Opening store at {path:?}");
        let mut conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise_with(|| format!("can't open store at {path:?}"))?;
        setup_conn(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().reraise("can't open in-memory store")?;
        setup_conn(&mut conn)?;

        Ok(Self { conn })
    }

    /// How long to wait for another connection's write lock before
    /// failing with [`crate::errors::ErrorKind::StoreUnavailable`].
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .busy_timeout(timeout)
            .reraise("error setting busy timeout")
    }
}

impl Store for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        // Take the write lock up front so two cycles can't interleave
        // between reading the watermark and advancing it.
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .reraise("can't begin unit of work")
    }

    fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .reraise("can't commit unit of work")
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .reraise("can't roll back unit of work")
    }

    fn insert_areas(&mut self, areas: Vec<RawArea>) -> Result<usize> {
        let count = areas.len();
        let txn = self.conn.savepoint().reraise("error inserting areas")?;
        for area in areas {
            tracing::trace!("Writing {area:?}");
            let body = encode_area(&area)?;
            txn.execute(
                "INSERT INTO areas (body, last_modified) VALUES (?1, ?2)",
                (body, area.last_modified),
            )
            .reraise("error inserting area")?;
        }
        txn.commit().reraise("error inserting areas")?;
        Ok(count)
    }

    fn stamp_untagged_areas(&mut self, now: Timestamp) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE areas SET last_modified = ?1 WHERE last_modified IS NULL",
                (now,),
            )
            .reraise("error tagging areas")
    }

    fn find_areas(&self, filter: AreaFilter) -> Result<Vec<StoredArea>> {
        let (sql, after) = match filter {
            AreaFilter::All => (
                "SELECT doc_id, body, last_modified FROM areas \
                 ORDER BY doc_id",
                None,
            ),
            AreaFilter::Untagged => (
                "SELECT doc_id, body, last_modified FROM areas \
                 WHERE last_modified IS NULL \
                 ORDER BY doc_id",
                None,
            ),
            AreaFilter::ModifiedAfter(after) => (
                "SELECT doc_id, body, last_modified FROM areas \
                 WHERE last_modified > ?1 \
                 ORDER BY doc_id",
                Some(after),
            ),
        };
        let mut stmt = self.conn.prepare(sql).reraise("error reading areas")?;
        let rows = match after {
            Some(after) => stmt.query_map((after,), read_area_row),
            None => stmt.query_map((), read_area_row),
        }
        .reraise("error reading areas")?
        // Collect so the statement's borrow of the connection ends
        // here.
        .collect::<rusqlite::Result<Vec<_>>>()
        .reraise("error unpacking area row")?;

        rows.into_iter()
            .map(|(doc_id, body, last_modified)| {
                decode_area(&body, last_modified).map(|area| StoredArea(DocId(doc_id), area))
            })
            .collect()
    }

    fn load_group<L: Level>(&self, key: &L::Key) -> Result<Option<Group<L>>> {
        let enc_key = encode_key(key)?;
        let row = self
            .conn
            .query_row(
                "SELECT members, last_modified FROM groups \
                 WHERE level = ?1 AND group_key = ?2",
                (L::NAME, &enc_key),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Timestamp>(1)?)),
            )
            .optional()
            .reraise_with(|| format!("error reading {} group {key:?}", L::NAME))?;
        row.map(|(members, last_modified)| decode_group(&enc_key, &members, last_modified))
            .transpose()
    }

    fn find_groups<L: Level>(&self) -> Result<Vec<Group<L>>> {
        let rows = self
            .conn
            .prepare(
                "SELECT group_key, members, last_modified FROM groups \
                 WHERE level = ?1",
            )
            .reraise("error reading groups")?
            .query_map((L::NAME,), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Timestamp>(2)?,
                ))
            })
            .reraise("error reading groups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .reraise("error unpacking group row")?;

        let mut groups = rows
            .iter()
            .map(|(key, members, last_modified)| decode_group(key, members, *last_modified))
            .collect::<Result<Vec<Group<L>>>>()?;
        // JSON text order isn't key order.
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(groups)
    }

    fn upsert_group<L: Level>(&mut self, group: &Group<L>) -> Result<()> {
        tracing::trace!("Writing {} group {:?}", L::NAME, group.key);
        self.conn
            .execute(
                "INSERT INTO groups (level, group_key, members, last_modified) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (level, group_key) DO UPDATE \
                 SET members = EXCLUDED.members, last_modified = EXCLUDED.last_modified",
                (
                    L::NAME,
                    encode_key(&group.key)?,
                    encode_members(&group.members)?,
                    group.last_modified,
                ),
            )
            .reraise_with(|| format!("error writing {} group {:?}", L::NAME, group.key))?;
        Ok(())
    }

    fn replace_summaries<L: Level>(
        &mut self,
        view: ViewKind,
        summaries: &[Summary<L::Key>],
    ) -> Result<()> {
        let txn = self.conn.savepoint().reraise("error replacing summaries")?;
        txn.execute(
            "DELETE FROM summaries WHERE view = ?1 AND level = ?2",
            (view.as_str(), L::NAME),
        )
        .reraise("error deleting summaries")?;
        for summary in summaries {
            tracing::trace!("Writing {view} {summary:?}");
            txn.execute(
                "INSERT INTO summaries \
                 (view, level, group_key, area_count, pop_sum, avg_pop, last_modified) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    view.as_str(),
                    L::NAME,
                    encode_key(&summary.key)?,
                    summary.area_count,
                    summary.pop_sum,
                    summary.avg_pop,
                    summary.last_modified,
                ),
            )
            .reraise_with(|| format!("error writing {} summary {:?}", L::NAME, summary.key))?;
        }
        txn.commit().reraise("error replacing summaries")
    }

    fn find_summaries<L: Level>(
        &self,
        view: ViewKind,
        after: Option<Timestamp>,
    ) -> Result<Vec<Summary<L::Key>>> {
        let rows = self
            .conn
            .prepare(
                "SELECT group_key, area_count, pop_sum, avg_pop, last_modified \
                 FROM summaries \
                 WHERE view = ?1 AND level = ?2 \
                 AND (?3 IS NULL OR last_modified > ?3)",
            )
            .reraise("error reading summaries")?
            .query_map((view.as_str(), L::NAME, after), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, Timestamp>(4)?,
                ))
            })
            .reraise("error reading summaries")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .reraise("error unpacking summary row")?;

        let mut summaries = rows
            .into_iter()
            .map(|(key, area_count, pop_sum, avg_pop, last_modified)| {
                Ok(Summary {
                    key: decode_key::<L::Key>(&key)?,
                    area_count,
                    pop_sum,
                    avg_pop,
                    last_modified,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(summaries)
    }

    fn load_watermark(&self) -> Result<Option<Timestamp>> {
        self.conn
            .query_row(
                "SELECT last_loaded_time FROM app_meta WHERE id = 1",
                (),
                |row| row.get::<_, Timestamp>(0),
            )
            .optional()
            .reraise("error reading watermark")
    }

    fn save_watermark(&mut self, at: Timestamp) -> Result<()> {
        tracing::trace!("Writing watermark {at:?}");
        self.conn
            .execute(
                "INSERT INTO app_meta (id, last_loaded_time) VALUES (1, ?1) \
                 ON CONFLICT (id) DO UPDATE \
                 SET last_loaded_time = EXCLUDED.last_loaded_time",
                (at,),
            )
            .reraise("error writing watermark")?;
        Ok(())
    }
}

fn read_area_row(row: &rusqlite::Row) -> rusqlite::Result<(u64, String, Option<Timestamp>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

#[test]
fn areas_keep_insertion_order_and_tag() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .insert_areas(vec![
            RawArea::new("02108", "Boston", "MA", 4000),
            RawArea::new("01001", "Agawam", "MA", 15338).with_last_modified(Timestamp(1)),
        ])
        .unwrap();

    let untagged = store.find_areas(AreaFilter::Untagged).unwrap();
    assert_eq!(untagged.len(), 1);
    assert_eq!(untagged[0].1.zip.as_deref(), Some("02108"));

    assert_eq!(store.stamp_untagged_areas(Timestamp(5)).unwrap(), 1);
    assert_eq!(store.stamp_untagged_areas(Timestamp(6)).unwrap(), 0);

    let found: Vec<_> = store
        .find_areas(AreaFilter::All)
        .unwrap()
        .into_iter()
        .map(|StoredArea(_doc_id, area)| (area.zip, area.last_modified))
        .collect();
    let expected = vec![
        (Some("02108".to_owned()), Some(Timestamp(5))),
        (Some("01001".to_owned()), Some(Timestamp(1))),
    ];
    assert_eq!(found, expected);

    let after = store.find_areas(AreaFilter::ModifiedAfter(Timestamp(1))).unwrap();
    assert_eq!(after.len(), 1);
}

#[test]
fn group_upsert_replaces() {
    use crate::level::CityLevel;
    use crate::model::{AreaRecord, CityKey};

    let mut store = SqliteStore::open_in_memory().unwrap();
    let key = CityKey::new("Agawam", "MA");
    let mut group = Group::<CityLevel>::new(key.clone(), Timestamp(1));
    group.members.insert(AreaRecord {
        zip: "01001".into(),
        city: "Agawam".into(),
        state: "MA".into(),
        pop: 15338,
        last_modified: Timestamp(1),
    });
    store.upsert_group(&group).unwrap();
    group.last_modified = Timestamp(2);
    store.upsert_group(&group).unwrap();

    assert_eq!(store.load_group::<CityLevel>(&key).unwrap(), Some(group));
    assert_eq!(
        store
            .load_group::<CityLevel>(&CityKey::new("Agawam", "CT"))
            .unwrap(),
        None
    );
    assert_eq!(store.find_groups::<CityLevel>().unwrap().len(), 1);
}

#[test]
fn stray_member_is_consistency_error() {
    use crate::errors::ErrorKind;
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .conn
        .execute(
            "INSERT INTO groups (level, group_key, members, last_modified) \
             VALUES ('city', ?1, ?2, 1)",
            (
                r#"{"city":"Agawam","state":"MA"}"#,
                r#"[{"zip":"62701","city":"Springfield","state":"IL","pop":5,"last_modified":1}]"#,
            ),
        )
        .unwrap();

    let err = store
        .load_group::<CityLevel>(&CityKey::new("Agawam", "MA"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
}

#[test]
fn rollback_discards_cycle_writes() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store.save_watermark(Timestamp(1)).unwrap();

    store.begin().unwrap();
    store.save_watermark(Timestamp(2)).unwrap();
    store
        .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
        .unwrap();
    store.rollback().unwrap();

    assert_eq!(store.load_watermark().unwrap(), Some(Timestamp(1)));
    assert!(store.find_areas(AreaFilter::All).unwrap().is_empty());
}

#[test]
fn failed_commit_leaves_store_usable() {
    use crate::clock::TestingClock;
    use crate::errors::ErrorKind;
    use crate::refresh::refresh;

    let mut store = SqliteStore::open_in_memory().unwrap();
    // Writing the watermark also writes a row that breaks a deferred
    // foreign key, which only fails at COMMIT.
    store
        .conn
        .execute_batch(
            "CREATE TABLE parents (id INTEGER PRIMARY KEY); \
             CREATE TABLE orphans ( \
             parent_id INTEGER REFERENCES parents (id) DEFERRABLE INITIALLY DEFERRED \
             ); \
             CREATE TRIGGER orphan_on_watermark AFTER INSERT ON app_meta \
             BEGIN INSERT INTO orphans (parent_id) VALUES (42); END;",
        )
        .unwrap();
    store
        .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
        .unwrap();
    let clock = TestingClock::new(Timestamp(100));

    let err = refresh(&mut store, &clock).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(store.conn.is_autocommit());
    assert_eq!(store.load_watermark().unwrap(), None);
    assert_eq!(store.find_areas(AreaFilter::Untagged).unwrap().len(), 1);

    store
        .conn
        .execute_batch("DROP TRIGGER orphan_on_watermark")
        .unwrap();
    let report = refresh(&mut store, &clock).unwrap();
    assert_eq!(report.city.selected, 1);
    assert_eq!(store.load_watermark().unwrap(), Some(Timestamp(100)));
}

#[test]
fn top_summaries_orders_by_population() {
    use crate::level::StateLevel;
    use crate::model::StateKey;

    let mut store = SqliteStore::open_in_memory().unwrap();
    let summary = |state: &str, pop_sum| Summary {
        key: StateKey(state.into()),
        area_count: 1,
        pop_sum,
        avg_pop: pop_sum,
        last_modified: Timestamp(1),
    };
    store
        .replace_summaries::<StateLevel>(
            ViewKind::Incremental,
            &[summary("CA", 10), summary("MA", 30), summary("NY", 30)],
        )
        .unwrap();

    let found: Vec<_> = store
        .top_summaries::<StateLevel>(ViewKind::Incremental, 2)
        .unwrap()
        .into_iter()
        .map(|s| s.key.0)
        .collect();
    assert_eq!(found, vec!["MA".to_owned(), "NY".to_owned()]);
}
