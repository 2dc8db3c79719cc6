//! In-memory runtime for workspace tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::lock::SchemaLock;
use crate::models::{SchemaDescription, TableDescription};
use crate::runtime::{ContainerRuntime, DbInstance, InstanceOptions, RuntimeConnector};

#[derive(Default)]
pub(crate) struct FakeRuntime {
    instances: Mutex<HashMap<String, Arc<FakeInstance>>>,
    create_delay: Duration,
    creations: AtomicUsize,
    connects: AtomicUsize,
    fail_next_create: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runtime whose container creation takes `delay`, widening races
    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay: delay,
            ..Default::default()
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn RuntimeConnector> {
        Arc::new(FakeConnector {
            runtime: self.clone(),
        })
    }

    /// Make a container exist before any workspace asks for it
    pub fn preload(&self, name: &str, image: &str) -> Arc<FakeInstance> {
        self.instances
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeInstance::new(name, image)))
            .clone()
    }

    pub fn instance(&self, name: &str) -> Option<Arc<FakeInstance>> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn find_or_create(&self, opts: &InstanceOptions) -> Result<Arc<dyn DbInstance>> {
        tokio::time::sleep(self.create_delay).await;
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("image {} not found", opts.image));
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        let instance: Arc<dyn DbInstance> = self.preload(&opts.name, &opts.image);
        Ok(instance)
    }
}

struct FakeConnector {
    runtime: Arc<FakeRuntime>,
}

#[async_trait]
impl RuntimeConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn ContainerRuntime>> {
        self.runtime.connects.fetch_add(1, Ordering::SeqCst);
        let runtime: Arc<dyn ContainerRuntime> = self.runtime.clone();
        Ok(runtime)
    }
}

#[derive(Debug, Clone, Default)]
struct FakeSchema {
    charset: String,
    /// Table name to row count
    tables: BTreeMap<String, u64>,
}

pub(crate) struct FakeInstance {
    name: String,
    image: String,
    schemas: Mutex<HashMap<String, FakeSchema>>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    lock_releases: Arc<AtomicUsize>,
    connect_calls: Mutex<Vec<(String, String)>>,
    stops: AtomicUsize,
    destroys: AtomicUsize,
    fail_create_schema: AtomicBool,
    fail_has_schema: AtomicBool,
    create_schema_delay: Mutex<Duration>,
}

impl FakeInstance {
    fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            schemas: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            lock_releases: Arc::new(AtomicUsize::new(0)),
            connect_calls: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            fail_create_schema: AtomicBool::new(false),
            fail_has_schema: AtomicBool::new(false),
            create_schema_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn add_table(&self, schema: &str, table: &str, rows: u64) {
        self.schemas
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), rows);
    }

    pub fn set_rows(&self, schema: &str, table: &str, rows: u64) {
        self.add_table(schema, table, rows);
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.schemas.lock().unwrap().contains_key(schema)
    }

    pub fn schema_charset(&self, schema: &str) -> Option<String> {
        self.schemas
            .lock()
            .unwrap()
            .get(schema)
            .map(|s| s.charset.clone())
    }

    pub fn tables(&self, schema: &str) -> Vec<String> {
        self.schemas
            .lock()
            .unwrap()
            .get(schema)
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, schema: &str, table: &str) -> Option<u64> {
        self.schemas
            .lock()
            .unwrap()
            .get(schema)?
            .tables
            .get(table)
            .copied()
    }

    pub fn lock_held(&self, name: &str) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(name)
            .map_or(false, |sem| sem.available_permits() == 0)
    }

    pub fn lock_releases(&self) -> usize {
        self.lock_releases.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> Vec<(String, String)> {
        self.connect_calls.lock().unwrap().clone()
    }

    pub fn fail_create_schema(&self, fail: bool) {
        self.fail_create_schema.store(fail, Ordering::SeqCst);
    }

    pub fn fail_has_schema(&self, fail: bool) {
        self.fail_has_schema.store(fail, Ordering::SeqCst);
    }

    /// Make `create_schema` take `delay` before doing anything
    pub fn delay_create_schema(&self, delay: Duration) {
        *self.create_schema_delay.lock().unwrap() = delay;
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    fn ensure_empty(&self, schema: &str) -> Result<()> {
        let schemas = self.schemas.lock().unwrap();
        if let Some(s) = schemas.get(schema) {
            if let Some((table, _)) = s.tables.iter().find(|(_, rows)| **rows > 0) {
                return Err(anyhow!("table {}.{} has at least one row", schema, table));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DbInstance for FakeInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &str {
        &self.image
    }

    async fn has_schema(&self, schema: &str) -> Result<bool> {
        if self.fail_has_schema.load(Ordering::SeqCst) {
            return Err(anyhow!("lost connection to server"));
        }
        Ok(self.schema_exists(schema))
    }

    async fn drop_tables_in_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        if only_if_empty {
            self.ensure_empty(schema)?;
        }
        if let Some(s) = self.schemas.lock().unwrap().get_mut(schema) {
            s.tables.clear();
        }
        Ok(())
    }

    async fn create_schema(&self, schema: &str, charset: &str, _collation: &str) -> Result<()> {
        let delay = *self.create_schema_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_create_schema.load(Ordering::SeqCst) {
            return Err(anyhow!("access denied for user 'root'"));
        }
        let mut schemas = self.schemas.lock().unwrap();
        if schemas.contains_key(schema) {
            return Err(anyhow!("database {} exists", schema));
        }
        schemas.insert(
            schema.to_string(),
            FakeSchema {
                charset: charset.to_string(),
                tables: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        if only_if_empty {
            self.ensure_empty(schema)?;
        }
        self.schemas.lock().unwrap().remove(schema);
        Ok(())
    }

    async fn schema(&self, schema: &str) -> Result<SchemaDescription> {
        let schemas = self.schemas.lock().unwrap();
        let s = schemas
            .get(schema)
            .ok_or_else(|| anyhow!("schema {} does not exist", schema))?;
        Ok(SchemaDescription {
            name: schema.to_string(),
            character_set: s.charset.clone(),
            collation: String::new(),
            tables: s
                .tables
                .keys()
                .map(|name| TableDescription {
                    name: name.clone(),
                    create_statement: format!("CREATE TABLE `{}` (id int)", name),
                })
                .collect(),
        })
    }

    async fn connect(&self, schema: &str, params: &str) -> Result<MySqlPool> {
        self.connect_calls
            .lock()
            .unwrap()
            .push((schema.to_string(), params.to_string()));
        Ok(MySqlPoolOptions::new().connect_lazy_with(MySqlConnectOptions::new().database(schema)))
    }

    async fn lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn SchemaLock>> {
        let semaphore = self
            .locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| anyhow!("timed out after {:?} waiting for lock {}", timeout, name))??;

        Ok(Box::new(FakeLock {
            name: name.to_string(),
            _permit: permit,
            releases: self.lock_releases.clone(),
        }))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeLock {
    name: String,
    _permit: OwnedSemaphorePermit,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl SchemaLock for FakeLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
