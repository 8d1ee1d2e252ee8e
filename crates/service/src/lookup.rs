use std::{collections::hash_map::Entry, net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use codec::header::Cid;
use parking_lot::{Mutex, RwLock};

/// Outcome of a connection ID insertion.
///
/// A collision hands back the connection already registered under the
/// ID; the table is left untouched and the existing connection wins.
pub enum Insert<C> {
    Inserted,
    Collided(Arc<C>),
}

/// Partitioned map from connection ID to connection.
///
/// Partition count starts at one and grows a single time, to the CPU
/// count, when the owning binding first gains a listener. A lookup
/// touches exactly the one partition named by the leading CID byte;
/// locally generated IDs are fully random, so server traffic spreads
/// evenly.
///
/// Alongside the primary index the table keeps a reverse index
/// (connection to its IDs, so bulk removal does not scan every
/// partition) and a remote-address index that pinned bindings use to
/// route unreachable notifications.
pub struct LookupTable<C> {
    partitions: RwLock<Vec<Mutex<HashMap<Cid, Arc<C>>>>>,
    by_conn: Mutex<HashMap<usize, Vec<Cid>>>,
    by_remote: Mutex<HashMap<SocketAddr, Arc<C>>>,
}

impl<C> Default for LookupTable<C> {
    fn default() -> Self {
        Self {
            partitions: RwLock::new(vec![Mutex::new(HashMap::new())]),
            by_conn: Mutex::new(HashMap::new()),
            by_remote: Mutex::new(HashMap::new()),
        }
    }
}

// Lock order everywhere: partitions (read or write), then by_conn, then
// a single partition mutex, then by_remote.
impl<C> LookupTable<C> {
    fn index(count: usize, cid: &Cid) -> usize {
        if count == 1 {
            0
        } else {
            cid.first_byte() as usize % count
        }
    }

    fn key(conn: &Arc<C>) -> usize {
        Arc::as_ptr(conn) as usize
    }

    /// Register a connection under an ID. `remote` is set by pinned
    /// bindings so the connection is also reachable by address.
    ///
    /// # Test
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use codec::header::Cid;
    /// use quic_endpoint_service::lookup::{Insert, LookupTable};
    ///
    /// let table: LookupTable<()> = LookupTable::default();
    /// let conn = Arc::new(());
    ///
    /// let cid = Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    /// assert!(matches!(table.insert(cid, None, &conn), Insert::Inserted));
    /// assert!(matches!(table.insert(cid, None, &conn), Insert::Collided(_)));
    /// assert!(table.find_by_cid(&cid).is_some());
    ///
    /// table.maximize_partitioning(4);
    /// assert!(table.find_by_cid(&cid).is_some());
    ///
    /// table.remove_all(&conn);
    /// assert!(table.find_by_cid(&cid).is_none());
    /// ```
    pub fn insert(&self, cid: Cid, remote: Option<SocketAddr>, conn: &Arc<C>) -> Insert<C> {
        let partitions = self.partitions.read();
        let mut by_conn = self.by_conn.lock();
        let mut partition = partitions[Self::index(partitions.len(), &cid)].lock();

        if let Some(existing) = partition.get(&cid) {
            return Insert::Collided(existing.clone());
        }

        partition.insert(cid, conn.clone());
        by_conn.entry(Self::key(conn)).or_default().push(cid);

        drop(partition);
        drop(by_conn);
        drop(partitions);

        if let Some(remote) = remote {
            self.by_remote.lock().insert(remote, conn.clone());
        }

        Insert::Inserted
    }

    pub fn remove(&self, cid: &Cid) -> Option<Arc<C>> {
        let partitions = self.partitions.read();
        let mut by_conn = self.by_conn.lock();
        let mut partition = partitions[Self::index(partitions.len(), cid)].lock();

        let conn = partition.remove(cid)?;

        let key = Self::key(&conn);
        if let Some(cids) = by_conn.get_mut(&key) {
            cids.retain(|it| it != cid);
            if cids.is_empty() {
                by_conn.remove(&key);
            }
        }

        Some(conn)
    }

    /// Remove every ID of a connection, and its remote-address entry.
    pub fn remove_all(&self, conn: &Arc<C>) {
        let mut partitions = self.partitions.write();
        let count = partitions.len();

        if let Some(cids) = self.by_conn.lock().remove(&Self::key(conn)) {
            for cid in cids {
                partitions[Self::index(count, &cid)].get_mut().remove(&cid);
            }
        }

        drop(partitions);
        self.by_remote.lock().retain(|_, it| !Arc::ptr_eq(it, conn));
    }

    /// Re-home every ID of a connection into another table, atomically
    /// from the caller's viewpoint. Both tables are locked exclusively,
    /// in address order, so concurrent movers cannot deadlock.
    pub fn move_all(&self, conn: &Arc<C>, dst: &LookupTable<C>) {
        if std::ptr::eq(self, dst) {
            return;
        }

        let (mut src_partitions, mut dst_partitions) = if (self as *const Self) < (dst as *const Self)
        {
            let src = self.partitions.write();
            let dst = dst.partitions.write();
            (src, dst)
        } else {
            let dst_guard = dst.partitions.write();
            let src = self.partitions.write();
            (src, dst_guard)
        };

        let src_count = src_partitions.len();
        let dst_count = dst_partitions.len();

        let key = Self::key(conn);
        if let Some(cids) = self.by_conn.lock().remove(&key) {
            let mut moved = Vec::with_capacity(cids.len());

            for cid in cids {
                if src_partitions[Self::index(src_count, &cid)]
                    .get_mut()
                    .remove(&cid)
                    .is_none()
                {
                    continue;
                }

                let partition = dst_partitions[Self::index(dst_count, &cid)].get_mut();
                if let Entry::Vacant(entry) = partition.entry(cid) {
                    entry.insert(conn.clone());
                    moved.push(cid);
                }
            }

            if !moved.is_empty() {
                dst.by_conn.lock().entry(key).or_default().extend(moved);
            }
        }

        drop(src_partitions);
        drop(dst_partitions);
        self.by_remote.lock().retain(|_, it| !Arc::ptr_eq(it, conn));
    }

    /// Look up the connection owning an ID; the returned clone is the
    /// caller's temporary reference.
    pub fn find_by_cid(&self, cid: &Cid) -> Option<Arc<C>> {
        let partitions = self.partitions.read();
        let partition = partitions[Self::index(partitions.len(), cid)].lock();
        partition.get(cid).cloned()
    }

    pub fn find_by_remote(&self, remote: &SocketAddr) -> Option<Arc<C>> {
        self.by_remote.lock().get(remote).cloned()
    }

    /// Grow from the single initial partition to `count` partitions.
    /// Monotone and one-shot: once partitioned, later calls are no-ops.
    pub fn maximize_partitioning(&self, count: usize) -> bool {
        let mut partitions = self.partitions.write();
        if partitions.len() > 1 {
            return true;
        }

        let count = count.max(1);
        let mut fresh: Vec<Mutex<HashMap<Cid, Arc<C>>>> =
            (0..count).map(|_| Mutex::new(HashMap::new())).collect();

        for (cid, conn) in partitions[0].get_mut().drain() {
            fresh[Self::index(count, &cid)].get_mut().insert(cid, conn);
        }

        *partitions = fresh;
        true
    }

    pub fn len(&self) -> usize {
        let partitions = self.partitions.read();
        partitions.iter().map(|it| it.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }
}
