use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::tenant_core::backend::BackendConn;
use crate::tenant_core::common::{Error, Result};

struct Entry {
    id: u64,
    conn: BackendConn,
}

struct PoolInner {
    idle: HashMap<String, Vec<Entry>>,
    /// Global recency order of idle connections, oldest first, used to pick an eviction
    /// candidate when the pool is at capacity and the requested database has no idle
    /// connection of its own. Resolves the open question of which database pays the
    /// eviction cost: whichever idle connection has sat unused longest, regardless of
    /// which database it belongs to.
    lru_order: VecDeque<(String, u64)>,
    total_open: u32,
    pending: HashMap<String, u32>,
    next_id: u64,
}

/// Pools backend connections across every database a tenant serves, under one global cap
/// on live connections. A connection idle for one database can be evicted to make room for
/// another database's request; connections checked out to a caller never are.
pub struct ConnPool {
    max_capacity: u32,
    inner: Mutex<PoolInner>,
    capacity_freed: Notify,
}

impl ConnPool {
    pub fn new(max_capacity: u32) -> Arc<Self> {
        Arc::new(ConnPool {
            max_capacity,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                lru_order: VecDeque::new(),
                total_open: 0,
                pending: HashMap::new(),
                next_id: 0,
            }),
            capacity_freed: Notify::new(),
        })
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// (total_open, max_capacity)
    pub fn current_capacity(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.total_open, self.max_capacity)
    }

    pub fn get_pending_conns(&self, dbname: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        *inner.pending.get(dbname).unwrap_or(&0)
    }

    /// Returns the backend pid of every idle connection currently held open, grouped by
    /// database — used for introspection and for ensure_database_not_connected's poll.
    pub fn iterate_connections(&self) -> HashMap<String, Vec<i32>> {
        let inner = self.inner.lock().unwrap();
        inner
            .idle
            .iter()
            .map(|(db, entries)| (db.clone(), entries.iter().map(|e| e.conn.backend_pid()).collect()))
            .collect()
    }

    /// Acquires a connection to `dbname`, reusing an idle one if available, opening a new
    /// one under the cap, or evicting the globally-least-recently-idle connection of a
    /// different database to make room. `connect` is only invoked while not holding the
    /// pool lock.
    pub async fn acquire<F, Fut>(self: &Arc<Self>, dbname: &str, connect: F) -> Result<PoolConnection>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<BackendConn>>,
    {
        loop {
            enum Action {
                Reuse(Entry),
                Open,
                EvictThenOpen(Entry, String),
                Wait,
            }

            // Registered before inspecting state, so a release/discard racing with the
            // decision below is never missed (tokio::sync::Notify guarantees a notify_one()
            // call after this point but before `.await` is still observed).
            let freed = self.capacity_freed.notified();

            let action = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entries) = inner.idle.get_mut(dbname) {
                    if let Some(entry) = entries.pop() {
                        inner.lru_order.retain(|(db, id)| !(db == dbname && *id == entry.id));
                        Action::Reuse(entry)
                    } else if inner.total_open < self.max_capacity {
                        inner.total_open += 1;
                        *inner.pending.entry(dbname.to_string()).or_insert(0) += 1;
                        Action::Open
                    } else if let Some((evict_db, evict_id)) = inner.lru_order.pop_front() {
                        let entries = inner.idle.get_mut(&evict_db).expect("lru entry without idle slot");
                        let pos = entries.iter().position(|e| e.id == evict_id).expect("lru entry missing");
                        let entry = entries.remove(pos);
                        *inner.pending.entry(dbname.to_string()).or_insert(0) += 1;
                        Action::EvictThenOpen(entry, evict_db)
                    } else {
                        Action::Wait
                    }
                } else if inner.total_open < self.max_capacity {
                    inner.total_open += 1;
                    *inner.pending.entry(dbname.to_string()).or_insert(0) += 1;
                    Action::Open
                } else if let Some((evict_db, evict_id)) = inner.lru_order.pop_front() {
                    let entries = inner.idle.get_mut(&evict_db).expect("lru entry without idle slot");
                    let pos = entries.iter().position(|e| e.id == evict_id).expect("lru entry missing");
                    let entry = entries.remove(pos);
                    *inner.pending.entry(dbname.to_string()).or_insert(0) += 1;
                    Action::EvictThenOpen(entry, evict_db)
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Reuse(entry) => {
                    return Ok(PoolConnection {
                        conn: Some(entry.conn),
                        id: entry.id,
                        dbname: dbname.to_string(),
                        pool: self.clone(),
                        poisoned: false,
                    });
                }
                Action::Open => {
                    let result = connect().await;
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(count) = inner.pending.get_mut(dbname) {
                        *count = count.saturating_sub(1);
                    }
                    match result {
                        Ok(conn) => {
                            let id = inner.next_id;
                            inner.next_id += 1;
                            return Ok(PoolConnection {
                                conn: Some(conn),
                                id,
                                dbname: dbname.to_string(),
                                pool: self.clone(),
                                poisoned: false,
                            });
                        }
                        Err(e) => {
                            inner.total_open -= 1;
                            self.capacity_freed.notify_one();
                            return Err(e);
                        }
                    }
                }
                Action::EvictThenOpen(evicted, evict_db) => {
                    debug!(evicted_db = %evict_db, requested_db = dbname, "evicting idle connection under capacity pressure");
                    evicted.conn.terminate();
                    let result = connect().await;
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(count) = inner.pending.get_mut(dbname) {
                        *count = count.saturating_sub(1);
                    }
                    match result {
                        Ok(conn) => {
                            let id = inner.next_id;
                            inner.next_id += 1;
                            return Ok(PoolConnection {
                                conn: Some(conn),
                                id,
                                dbname: dbname.to_string(),
                                pool: self.clone(),
                                poisoned: false,
                            });
                        }
                        Err(e) => {
                            inner.total_open -= 1;
                            self.capacity_freed.notify_one();
                            return Err(e);
                        }
                    }
                }
                Action::Wait => {
                    freed.await;
                }
            }
        }
    }

    fn release(&self, id: u64, dbname: String, conn: BackendConn) {
        if !conn.is_healthy() {
            return self.discard(dbname, conn);
        }
        conn.set_idle(true);
        let mut inner = self.inner.lock().unwrap();
        inner.idle.entry(dbname.clone()).or_default().push(Entry { id, conn });
        inner.lru_order.push_back((dbname, id));
        drop(inner);
        self.capacity_freed.notify_one();
    }

    fn discard(&self, dbname: String, conn: BackendConn) {
        warn!(dbname, "discarding unhealthy connection instead of returning it to the pool");
        conn.terminate();
        let mut inner = self.inner.lock().unwrap();
        inner.total_open = inner.total_open.saturating_sub(1);
        drop(inner);
        self.capacity_freed.notify_one();
    }

    /// Closes every idle connection across every database. Checked-out connections are
    /// unaffected and will be closed as they're released if still flagged unhealthy.
    pub fn prune_all_connections(&self) {
        let mut inner = self.inner.lock().unwrap();
        let idle = std::mem::take(&mut inner.idle);
        inner.lru_order.clear();
        let closed = idle.values().map(Vec::len).sum::<usize>() as u32;
        inner.total_open = inner.total_open.saturating_sub(closed);
        drop(inner);
        for (_, entries) in idle {
            for entry in entries {
                entry.conn.terminate();
            }
        }
        self.capacity_freed.notify_waiters();
    }

    /// Closes idle connections for one database only (used after a database is dropped or
    /// unregistered).
    pub fn prune_inactive_connections(&self, dbname: &str) {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.idle.remove(dbname).unwrap_or_default();
        inner.lru_order.retain(|(db, _)| db != dbname);
        inner.total_open = inner.total_open.saturating_sub(entries.len() as u32);
        drop(inner);
        for entry in entries {
            entry.conn.terminate();
        }
        self.capacity_freed.notify_waiters();
    }
}

/// A checked-out connection. Returned to its pool's idle set on drop, unless marked broken.
pub struct PoolConnection {
    conn: Option<BackendConn>,
    id: u64,
    dbname: String,
    pool: Arc<ConnPool>,
    poisoned: bool,
}

impl PoolConnection {
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Marks this connection as unusable; it will be closed rather than returned to the
    /// pool's idle set when dropped.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn into_inner(mut self) -> BackendConn {
        self.conn.take().expect("PoolConnection already consumed")
    }

    pub fn close_error() -> Error {
        Error::closed()
    }
}

impl Deref for PoolConnection {
    type Target = BackendConn;
    fn deref(&self) -> &BackendConn {
        self.conn.as_ref().expect("PoolConnection already consumed")
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut BackendConn {
        self.conn.as_mut().expect("PoolConnection already consumed")
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.poisoned || !conn.is_healthy() {
                self.pool.discard(self.dbname.clone(), conn);
            } else {
                self.pool.release(self.id, self.dbname.clone(), conn);
            }
        }
    }
}
