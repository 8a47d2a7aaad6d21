use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tempfile::TempDir;

use crate::backend::{Backend, ZsetAdmission};
use crate::types::{ErrorKind, Result};

/// Valid eviction policies for the spawned server
const MAXMEMORY_POLICIES: &[&str] = &[
    "volatile-lru",
    "allkeys-lru",
    "volatile-lfu",
    "allkeys-lfu",
    "volatile-random",
    "allkeys-random",
    "volatile-ttl",
    "noeviction",
];

/// How often and how long to retry connecting to a freshly spawned server
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// `INCRBYFLOAT`, setting the TTL only when the key was created
const INCR_LUA: &str = r"
    local value = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
    if redis.call('PTTL', KEYS[1]) < 0 then
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return value
";

/// Compare-and-swap. ARGV[1] is '1' when a current value is expected,
/// ARGV[2] the expected bytes, ARGV[3] the new bytes, ARGV[4] the TTL.
const CAS_LUA: &str = r"
    local current = redis.call('GET', KEYS[1])
    if ARGV[1] == '1' then
        if current == false or current ~= ARGV[2] then
            return 0
        end
    elseif current ~= false then
        return 0
    end
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
    return 1
";

/// The sliding-window admission step: prune, then insert only below the
/// limit. Returns {1, ''} on insert, {0, oldest-score} when full.
const PRUNE_INSERT_LUA: &str = r"
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
    local count = redis.call('ZCARD', KEYS[1])
    if count < tonumber(ARGV[2]) then
        redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
        redis.call('PEXPIRE', KEYS[1], ARGV[5])
        return {1, ''}
    end
    local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    return {0, oldest[2]}
";

/// Connection options for the key-value backend.
///
/// Without a `host` a temporary `redis-server` is spawned on a unix socket
/// and torn down when the backend closes; with one, the external endpoint
/// is used as-is and nothing is spawned.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// External server host; `None` spawns a temporary server
    pub host: Option<String>,
    /// External server port
    pub port: Option<u16>,
    /// Credentials for an external server
    pub username: Option<String>,
    /// Credentials for an external server
    pub password: Option<String>,
    /// Database filename for the spawned server (enables persistence)
    pub dbfilename: Option<PathBuf>,
    /// Memory ceiling for the spawned server, e.g. `"64mb"`
    pub maxmemory: Option<String>,
    /// Eviction policy for the spawned server
    pub maxmemory_policy: Option<String>,
    /// RESP protocol version, 2 or 3
    pub protocol: u8,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            host: None,
            port: None,
            username: None,
            password: None,
            dbfilename: None,
            maxmemory: None,
            maxmemory_policy: None,
            protocol: 2,
        }
    }
}

impl KvConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !matches!(self.protocol, 2 | 3) {
            return Err(ErrorKind::InvalidConfig(format!(
                "kv protocol must be 2 or 3, got {}",
                self.protocol
            )));
        }
        if let Some(policy) = &self.maxmemory_policy {
            if !MAXMEMORY_POLICIES.contains(&policy.as_str()) {
                return Err(ErrorKind::InvalidConfig(format!(
                    "unknown maxmemory policy `{policy}`"
                )));
            }
            if policy != "noeviction" && self.maxmemory.is_none() {
                return Err(ErrorKind::InvalidConfig(
                    "maxmemory must be set when maxmemory_policy is not noeviction".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A spawned server and the directory holding its socket (and database)
#[derive(Debug)]
struct SpawnedServer {
    child: Child,
    _dir: TempDir,
}

/// Key-value backend: a thin adaptor over an embedded redis server.
///
/// Plain operations map to native commands; `incr`, `cas`, and the guarded
/// sliding-window insert run as server-side scripts so they stay atomic.
pub struct KvBackend {
    manager: ConnectionManager,
    server: Mutex<Option<SpawnedServer>>,
    incr_script: Script,
    cas_script: Script,
    prune_insert_script: Script,
}

impl fmt::Debug for KvBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvBackend")
            .field(
                "spawned",
                &self.server.lock().map(|s| s.is_some()).unwrap_or(false),
            )
            .finish_non_exhaustive()
    }
}

impl KvBackend {
    /// Connect to the configured server, spawning a temporary one first
    /// when no external endpoint is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the server cannot
    /// be spawned, or no connection could be established.
    pub async fn open(config: KvConfig) -> Result<Self> {
        config.validate()?;
        let (url, server) = match &config.host {
            Some(host) => (external_url(&config, host), None),
            None => {
                let server = spawn_server(&config)?;
                let socket = server._dir.path().join("kv.sock");
                (format!("redis+unix://{}", socket.display()), Some(server))
            }
        };
        debug!("connecting to key-value backend at {url}");
        let client = redis::Client::open(url)?;
        let manager = connect_with_retry(&client).await?;
        Ok(KvBackend {
            manager,
            server: Mutex::new(server),
            incr_script: Script::new(INCR_LUA),
            cas_script: Script::new(CAS_LUA),
            prune_insert_script: Script::new(PRUNE_INSERT_LUA),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

impl Drop for KvBackend {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.server.lock() {
            if let Some(mut server) = guard.take() {
                let _ = server.child.kill();
                let _ = server.child.wait();
            }
        }
    }
}

fn external_url(config: &KvConfig, host: &str) -> String {
    let mut url = String::from("redis://");
    match (&config.username, &config.password) {
        (Some(user), Some(pass)) => {
            url.push_str(&format!("{user}:{pass}@"));
        }
        (None, Some(pass)) => {
            url.push_str(&format!(":{pass}@"));
        }
        _ => {}
    }
    url.push_str(host);
    url.push_str(&format!(":{}", config.port.unwrap_or(6379)));
    if config.protocol == 3 {
        url.push_str("/?protocol=resp3");
    }
    url
}

fn spawn_server(config: &KvConfig) -> Result<SpawnedServer> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("kv.sock");
    let mut command = Command::new("redis-server");
    command
        .arg("--port")
        .arg("0")
        .arg("--unixsocket")
        .arg(&socket)
        .arg("--unixsocketperm")
        .arg("700")
        .arg("--appendonly")
        .arg("no")
        .arg("--dir")
        .arg(dir.path());
    match &config.dbfilename {
        Some(dbfilename) => {
            command.arg("--dbfilename").arg(dbfilename);
        }
        None => {
            command.arg("--save").arg("");
        }
    }
    if let Some(maxmemory) = &config.maxmemory {
        command.arg("--maxmemory").arg(maxmemory);
    }
    if let Some(policy) = &config.maxmemory_policy {
        command.arg("--maxmemory-policy").arg(policy);
    }
    let child = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ErrorKind::KvServer(format!("cannot spawn redis-server: {e}")))?;
    debug!("spawned key-value server (pid {})", child.id());
    Ok(SpawnedServer { child, _dir: dir })
}

async fn connect_with_retry(client: &redis::Client) -> Result<ConnectionManager> {
    let mut last_error = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match client.get_connection_manager().await {
            Ok(manager) => return Ok(manager),
            Err(e) => {
                last_error = Some(e);
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(ErrorKind::KvServer(format!(
        "server never became ready: {}",
        last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
    )))
}

/// Milliseconds for PX/PEXPIRE arguments; redis rejects zero
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Format a score bound the way redis expects them
fn score_bound(value: f64) -> String {
    if value == f64::INFINITY {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{value}")
    }
}

#[async_trait]
impl Backend for KvBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let () = conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let mut conn = self.conn();
        let value: String = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value.parse().unwrap_or_default())
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(i32::from(expected.is_some()).to_string())
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(lo))
            .arg(score_bound(hi))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn zcount(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(score_bound(lo))
            .arg(score_bound(hi))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn zfirst(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    async fn zprunecard_insert(
        &self,
        key: &str,
        cutoff: f64,
        limit: u64,
        score: f64,
        member: &str,
        ttl: Duration,
    ) -> Result<ZsetAdmission> {
        let mut conn = self.conn();
        let (inserted, oldest): (i64, String) = self
            .prune_insert_script
            .key(key)
            .arg(score_bound(cutoff))
            .arg(limit)
            .arg(score)
            .arg(member)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        if inserted == 1 {
            Ok(ZsetAdmission::Inserted)
        } else {
            Ok(ZsetAdmission::Full {
                oldest: oldest.parse().unwrap_or(score),
            })
        }
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let mut conn = self.conn();
        // KEYS is fine here: the backend owns a private (usually embedded)
        // server, not a shared production instance
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await?;
        if !keys.is_empty() {
            let () = conn.del(keys).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let server = self.server.lock().unwrap().take();
        if let Some(mut server) = server {
            if let Err(e) = server.child.kill() {
                warn!("could not stop key-value server: {e}");
            }
            let _ = server.child.wait();
        }
        Ok(())
    }
}
