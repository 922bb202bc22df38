#![forbid(unsafe_code)]

//! The storage engine: one `Engine` per process owning every database,
//! the client registry, pub/sub state, transactions, blocking pops and
//! the timer queue. The engine never touches sockets; `dispatch`
//! returns the frames to write and the server shell routes them.

mod sort;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use qs_config::Config;
use qs_expire::{TimerId, TimerQueue};
use qs_persist::Snapshot;
use qs_protocol::RespFrame;
use qs_store::{Aggregate, ClientId, Db, ScoreBound, Ttl, Value, Zset, glob_match};
use tracing::{error, info, warn};

const SERVER_VERSION: &str = "0.1.0";

const WRONGTYPE_MESSAGE: &str =
    "WRONGTYPE Operation against a key holding the wrong kind of value";
const PUBSUB_ONLY: &str =
    "only (P)SUBSCRIBE / (P)UNSUBSCRIBE / QUIT allowed in this context";
const NOT_SUPPORTED: &str = "Command not yet supported";
const INVALID_TIMEOUT: &str = "invalid expire time";
const INVALID_SCORE: &str = "Invalid score value";
const SYNTAX_ERROR: &str = "Syntax error";
const OUT_OF_BOUND: &str = "Out of bound";

/// Failures a command can answer with. Every variant maps to a single
/// RESP error frame; none of them tear the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    WrongArity(String),
    UnknownCommand(String),
    WrongType,
    NoAuth,
    NotSupported,
    InvalidTimeout,
    InvalidScore,
    Syntax,
    OutOfBound,
    Custom(String),
    Internal(String),
}

impl CommandError {
    fn wrong_arity(command: &str) -> Self {
        CommandError::WrongArity(command.to_owned())
    }

    #[must_use]
    pub fn to_frame(&self) -> RespFrame {
        let message = match self {
            CommandError::WrongArity(cmd) => {
                format!("ERR wrong number of arguments for '{cmd}'")
            }
            CommandError::UnknownCommand(cmd) => format!("ERR unknown command '{cmd}'"),
            CommandError::WrongType => WRONGTYPE_MESSAGE.to_owned(),
            CommandError::NoAuth => "NOAUTH Authentication required".to_owned(),
            CommandError::NotSupported => format!("ERR {NOT_SUPPORTED}"),
            CommandError::InvalidTimeout => format!("ERR {INVALID_TIMEOUT}"),
            CommandError::InvalidScore => format!("ERR {INVALID_SCORE}"),
            CommandError::Syntax => format!("ERR {SYNTAX_ERROR}"),
            CommandError::OutOfBound => format!("ERR {OUT_OF_BOUND}"),
            CommandError::Custom(message) => format!("ERR {message}"),
            CommandError::Internal(_) => "ERR Server Error".to_owned(),
        };
        RespFrame::Error(message)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_frame() {
            RespFrame::Error(message) => write!(f, "{message}"),
            _ => write!(f, "command error"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Convert a decoded request frame into the argv the dispatcher works
/// on.
pub fn frame_to_argv(frame: &RespFrame) -> Result<Vec<Vec<u8>>, CommandError> {
    let RespFrame::Array(Some(items)) = frame else {
        return Err(CommandError::Custom("invalid request frame".to_owned()));
    };
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespFrame::BulkString(Some(bytes)) => argv.push(bytes.clone()),
            RespFrame::SimpleString(text) => argv.push(text.as_bytes().to_vec()),
            RespFrame::Integer(n) => argv.push(n.to_string().into_bytes()),
            _ => return Err(CommandError::Custom("invalid request frame".to_owned())),
        }
    }
    Ok(argv)
}

/// Commands the engine implements, plus one bucket for the surface we
/// deliberately answer with "not supported".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandId {
    // Keys
    Del, Dump, Exists, Expire, Expireat, Keys, Move, Persist, Pexpire,
    Pexpireat, Pttl, Randomkey, Rename, Renamenx, Restore, Sort, Ttl, Type,
    // Strings
    Append, Bitcount, Bitop, Decr, Decrby, Get, Getbit, Getrange, Getset,
    Incr, Incrby, Incrbyfloat, Mget, Mset, Msetnx, Psetex, Set, Setbit,
    Setex, Setnx, Setrange, Strlen,
    // Hashes
    Hdel, Hexists, Hget, Hgetall, Hincrby, Hincrbyfloat, Hkeys, Hlen,
    Hmget, Hmset, Hset, Hsetnx, Hvals,
    // Lists
    Blpop, Brpop, Brpoplpush, Lindex, Linsert, Llen, Lpop, Lpush, Lpushx,
    Lrange, Lrem, Lset, Ltrim, Rpop, Rpoplpush, Rpush, Rpushx,
    // Sets
    Sadd, Scard, Sdiff, Sdiffstore, Sinter, Sinterstore, Sismember,
    Smembers, Smove, Spop, Srandmember, Srem, Sunion, Sunionstore,
    // Sorted sets
    Zadd, Zcard, Zcount, Zincrby, Zinterstore, Zrange, Zrangebyscore,
    Zrank, Zrem, Zremrangebyrank, Zremrangebyscore, Zscore, Zunionstore,
    // Pub/sub
    Psubscribe, Publish, Pubsub, Punsubscribe, Subscribe, Unsubscribe,
    // Transactions
    Discard, Exec, Multi, Unwatch, Watch,
    // Connection
    Auth, Echo, Ping, Quit, Select,
    // Server
    Bgsave, Client, Config, Dbsize, Flushall, Flushdb, Info, Lastsave,
    Monitor, Save, Time,
    // Deliberate compatibility boundary
    Unsupported,
}

fn classify_command(name: &[u8]) -> Option<CommandId> {
    use CommandId::*;
    Some(match name {
        b"del" => Del,
        b"dump" => Dump,
        b"exists" => Exists,
        b"expire" => Expire,
        b"expireat" => Expireat,
        b"keys" => Keys,
        b"move" => Move,
        b"persist" => Persist,
        b"pexpire" => Pexpire,
        b"pexpireat" => Pexpireat,
        b"pttl" => Pttl,
        b"randomkey" => Randomkey,
        b"rename" => Rename,
        b"renamenx" => Renamenx,
        b"restore" => Restore,
        b"sort" => Sort,
        b"ttl" => Ttl,
        b"type" => Type,
        b"append" => Append,
        b"bitcount" => Bitcount,
        b"bitop" => Bitop,
        b"decr" => Decr,
        b"decrby" => Decrby,
        b"get" => Get,
        b"getbit" => Getbit,
        b"getrange" => Getrange,
        b"getset" => Getset,
        b"incr" => Incr,
        b"incrby" => Incrby,
        b"incrbyfloat" => Incrbyfloat,
        b"mget" => Mget,
        b"mset" => Mset,
        b"msetnx" => Msetnx,
        b"psetex" => Psetex,
        b"set" => Set,
        b"setbit" => Setbit,
        b"setex" => Setex,
        b"setnx" => Setnx,
        b"setrange" => Setrange,
        b"strlen" => Strlen,
        b"hdel" => Hdel,
        b"hexists" => Hexists,
        b"hget" => Hget,
        b"hgetall" => Hgetall,
        b"hincrby" => Hincrby,
        b"hincrbyfloat" => Hincrbyfloat,
        b"hkeys" => Hkeys,
        b"hlen" => Hlen,
        b"hmget" => Hmget,
        b"hmset" => Hmset,
        b"hset" => Hset,
        b"hsetnx" => Hsetnx,
        b"hvals" => Hvals,
        b"blpop" => Blpop,
        b"brpop" => Brpop,
        b"brpoplpush" => Brpoplpush,
        b"lindex" => Lindex,
        b"linsert" => Linsert,
        b"llen" => Llen,
        b"lpop" => Lpop,
        b"lpush" => Lpush,
        b"lpushx" => Lpushx,
        b"lrange" => Lrange,
        b"lrem" => Lrem,
        b"lset" => Lset,
        b"ltrim" => Ltrim,
        b"rpop" => Rpop,
        b"rpoplpush" => Rpoplpush,
        b"rpush" => Rpush,
        b"rpushx" => Rpushx,
        b"sadd" => Sadd,
        b"scard" => Scard,
        b"sdiff" => Sdiff,
        b"sdiffstore" => Sdiffstore,
        b"sinter" => Sinter,
        b"sinterstore" => Sinterstore,
        b"sismember" => Sismember,
        b"smembers" => Smembers,
        b"smove" => Smove,
        b"spop" => Spop,
        b"srandmember" => Srandmember,
        b"srem" => Srem,
        b"sunion" => Sunion,
        b"sunionstore" => Sunionstore,
        b"zadd" => Zadd,
        b"zcard" => Zcard,
        b"zcount" => Zcount,
        b"zincrby" => Zincrby,
        b"zinterstore" => Zinterstore,
        b"zrange" => Zrange,
        b"zrangebyscore" => Zrangebyscore,
        b"zrank" => Zrank,
        b"zrem" => Zrem,
        b"zremrangebyrank" => Zremrangebyrank,
        b"zremrangebyscore" => Zremrangebyscore,
        b"zscore" => Zscore,
        b"zunionstore" => Zunionstore,
        b"psubscribe" => Psubscribe,
        b"publish" => Publish,
        b"pubsub" => Pubsub,
        b"punsubscribe" => Punsubscribe,
        b"subscribe" => Subscribe,
        b"unsubscribe" => Unsubscribe,
        b"discard" => Discard,
        b"exec" => Exec,
        b"multi" => Multi,
        b"unwatch" => Unwatch,
        b"watch" => Watch,
        b"auth" => Auth,
        b"echo" => Echo,
        b"ping" => Ping,
        b"quit" => Quit,
        b"select" => Select,
        b"bgsave" => Bgsave,
        b"client" => Client,
        b"config" => Config,
        b"dbsize" => Dbsize,
        b"flushall" => Flushall,
        b"flushdb" => Flushdb,
        b"info" => Info,
        b"lastsave" => Lastsave,
        b"monitor" => Monitor,
        b"save" => Save,
        b"time" => Time,
        b"migrate" | b"object" | b"scan" | b"hscan" | b"sscan" | b"zscan"
        | b"zrevrange" | b"zrevrangebyscore" | b"eval" | b"evalsha" | b"script"
        | b"bgrewriteaof" | b"debug" | b"shutdown" | b"slaveof" | b"slowlog"
        | b"sync" => Unsupported,
        _ => return None,
    })
}

/// What a handler produced for the issuing client.
enum Reply {
    Frame(RespFrame),
    /// Several frames in sequence (subscribe family).
    Multi(Vec<RespFrame>),
    /// The client is now blocked; no reply yet.
    Blocked,
}

impl Reply {
    fn ok() -> Result<Reply, CommandError> {
        Ok(Reply::Frame(RespFrame::ok()))
    }

    fn int(value: i64) -> Result<Reply, CommandError> {
        Ok(Reply::Frame(RespFrame::Integer(value)))
    }

    fn bulk(bytes: impl Into<Vec<u8>>) -> Result<Reply, CommandError> {
        Ok(Reply::Frame(RespFrame::bulk(bytes)))
    }

    fn null() -> Result<Reply, CommandError> {
        Ok(Reply::Frame(RespFrame::null()))
    }

    fn frame(frame: RespFrame) -> Result<Reply, CommandError> {
        Ok(Reply::Frame(frame))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    HeadPop,
    TailPop,
    TailPopPush,
}

/// Waiter record for a blocked BLPOP/BRPOP/BRPOPLPUSH call. At most
/// one exists per client.
#[derive(Debug)]
struct Blocked {
    kind: BlockKind,
    keys: Vec<Vec<u8>>,
    dest: Option<Vec<u8>>,
    timer: Option<TimerId>,
}

/// Per-connection state, created on accept and purged on disconnect.
#[derive(Debug)]
pub struct ClientState {
    addr: String,
    connected_at_ms: u64,
    db_index: usize,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
    transaction: Option<Vec<Vec<Vec<u8>>>>,
    watched_keys: Option<HashSet<Vec<u8>>>,
    dirty_cas: bool,
    blocked: Option<Blocked>,
    given_password: Vec<u8>,
    last_command: String,
}

impl ClientState {
    fn new(addr: String, now_ms: u64) -> Self {
        Self {
            addr,
            connected_at_ms: now_ms,
            db_index: 0,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            transaction: None,
            watched_keys: None,
            dirty_cas: false,
            blocked: None,
            given_password: Vec::new(),
            last_command: String::new(),
        }
    }

    fn in_pubsub_mode(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty()
    }
}

/// Payloads carried by the engine's timer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerEvent {
    ExpireKey { db: usize, key: Vec<u8> },
    BlockTimeout { client: ClientId },
    SaveTick,
}

/// Result of one dispatched request: frames to write (not only to the
/// dispatching client) and whether to close it afterwards.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub writes: Vec<(ClientId, RespFrame)>,
    pub close: bool,
}

pub struct Engine {
    config: Config,
    dbs: Vec<Db>,
    clients: HashMap<ClientId, ClientState>,
    next_client_id: ClientId,
    channels: HashMap<Vec<u8>, HashSet<ClientId>>,
    patterns: HashMap<Vec<u8>, HashSet<ClientId>>,
    watching: HashSet<ClientId>,
    monitors: HashSet<ClientId>,
    timers: TimerQueue<TimerEvent>,
    outbox: Vec<(ClientId, RespFrame)>,
    close_after_reply: bool,
    dirty: u64,
    blocked_clients: u64,
    last_save_ms: u64,
    rng: u64,
}

impl Engine {
    /// Build the engine, load the snapshot when persistence is enabled,
    /// and start the save cron.
    pub fn new(config: Config, now_ms: u64) -> Self {
        let databases = config.databases.max(1);
        let mut engine = Self {
            dbs: (0..databases).map(Db::new).collect(),
            clients: HashMap::new(),
            next_client_id: 1,
            channels: HashMap::new(),
            patterns: HashMap::new(),
            watching: HashSet::new(),
            monitors: HashSet::new(),
            timers: TimerQueue::new(),
            outbox: Vec::new(),
            close_after_reply: false,
            dirty: 0,
            blocked_clients: 0,
            last_save_ms: now_ms,
            rng: 0x2545_f491_4f6c_dd1d,
            config,
        };
        if engine.config.persistence_enabled() {
            engine.load_snapshot();
            engine.timers.schedule(now_ms + 1_000, TimerEvent::SaveTick);
        }
        engine
    }

    fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.config.filename)
    }

    fn load_snapshot(&mut self) {
        let path = self.snapshot_path();
        match qs_persist::load_from_path(&path) {
            Ok(Some(snapshot)) => {
                let mut loaded = 0;
                for (index, entries) in snapshot.dbs {
                    if let Some(db) = self.dbs.get_mut(index as usize) {
                        loaded += entries.len();
                        db.load_entries(entries);
                    }
                }
                info!(path = %path.display(), keys = loaded, "loaded snapshot");
            }
            Ok(None) => {}
            Err(err) => warn!(path = %path.display(), %err, "failed to load snapshot"),
        }
    }

    fn save_snapshot(&mut self, now_ms: u64) {
        let snapshot = Snapshot {
            dbs: self
                .dbs
                .iter()
                .filter(|db| db.persisted_len() > 0)
                .map(|db| (db.index() as u32, db.snapshot_entries()))
                .collect(),
        };
        let path = self.snapshot_path();
        match qs_persist::save_to_path(&path, &snapshot) {
            Ok(()) => {
                self.dirty = 0;
                self.last_save_ms = now_ms;
                info!(path = %path.display(), "wrote snapshot");
            }
            Err(err) => warn!(path = %path.display(), %err, "snapshot save failed"),
        }
    }

    /// Register a new connection.
    pub fn connect(&mut self, addr: impl Into<String>, now_ms: u64) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, ClientState::new(addr.into(), now_ms));
        id
    }

    /// Purge a closed connection from every registry it touched.
    pub fn disconnect(&mut self, client: ClientId) {
        let Some(state) = self.clients.remove(&client) else {
            return;
        };
        self.monitors.remove(&client);
        self.watching.remove(&client);
        for channel in &state.channels {
            if let Some(subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(&client);
                if subscribers.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        for pattern in &state.patterns {
            if let Some(subscribers) = self.patterns.get_mut(pattern) {
                subscribers.remove(&client);
                if subscribers.is_empty() {
                    self.patterns.remove(pattern);
                }
            }
        }
        if let Some(blocked) = state.blocked {
            let db = state.db_index;
            for key in &blocked.keys {
                self.dbs[db].remove_waiter(key, client);
            }
            if let Some(timer) = blocked.timer {
                self.timers.cancel(timer);
            }
            self.blocked_clients = self.blocked_clients.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Fire every due timer: key evictions, blocking timeouts, save
    /// cron. Returns the frames produced (timeout null replies).
    pub fn on_tick(&mut self, now_ms: u64) -> Vec<(ClientId, RespFrame)> {
        for (timer, event) in self.timers.pop_due(now_ms) {
            match event {
                TimerEvent::ExpireKey { db, key } => {
                    self.dbs[db].evict(&key, timer);
                }
                TimerEvent::BlockTimeout { client } => self.block_timed_out(client),
                TimerEvent::SaveTick => {
                    self.run_save_check(now_ms);
                    self.timers.schedule(now_ms + 1_000, TimerEvent::SaveTick);
                }
            }
        }
        std::mem::take(&mut self.outbox)
    }

    fn run_save_check(&mut self, now_ms: u64) {
        if self.dirty == 0 {
            return;
        }
        let gap_s = now_ms.saturating_sub(self.last_save_ms) / 1_000;
        let triggered = self
            .config
            .save_points
            .iter()
            .any(|point| gap_s >= point.seconds && self.dirty >= point.changes);
        if triggered {
            self.save_snapshot(now_ms);
        }
    }

    /// Execute one decoded request for `client`.
    pub fn dispatch(
        &mut self,
        client: ClientId,
        argv: Vec<Vec<u8>>,
        now_ms: u64,
    ) -> DispatchResult {
        self.close_after_reply = false;
        if argv.is_empty() {
            self.outbox.push((
                client,
                RespFrame::Error("ERR no command".to_owned()),
            ));
            return self.drain(client);
        }
        let name = String::from_utf8_lossy(&argv[0]).to_lowercase();
        if !self.monitors.is_empty() {
            self.feed_monitors(client, &argv, now_ms);
        }

        let gate = self.gate(client, &name, &argv);
        let reply = match gate {
            Gate::Reply(frame) => Ok(Reply::Frame(frame)),
            Gate::Run => self.run_command(client, &name, &argv, now_ms, false),
        };
        match reply {
            Ok(Reply::Frame(frame)) => self.outbox.push((client, frame)),
            Ok(Reply::Multi(frames)) => {
                for frame in frames {
                    self.outbox.push((client, frame));
                }
            }
            Ok(Reply::Blocked) => {}
            Err(err) => {
                if let CommandError::Internal(detail) = &err {
                    error!(command = %name, %detail, "command failed internally");
                }
                self.outbox.push((client, err.to_frame()));
            }
        }
        if let Some(state) = self.clients.get_mut(&client) {
            state.last_command = name;
        }
        self.drain(client)
    }

    fn drain(&mut self, _client: ClientId) -> DispatchResult {
        DispatchResult {
            writes: std::mem::take(&mut self.outbox),
            close: std::mem::take(&mut self.close_after_reply),
        }
    }

    /// Connection-level gating, in priority order: pub/sub-only mode,
    /// blocked, queued-in-transaction.
    fn gate(&mut self, client: ClientId, name: &str, argv: &[Vec<u8>]) -> Gate {
        let Some(state) = self.clients.get_mut(&client) else {
            return Gate::Reply(RespFrame::Error("ERR unknown client".to_owned()));
        };
        if state.in_pubsub_mode() && !is_subscribe_command(name) {
            return Gate::Reply(RespFrame::Error(format!("ERR {PUBSUB_ONLY}")));
        }
        if state.blocked.is_some() {
            return Gate::Reply(RespFrame::Error(
                "ERR Blocked client cannot request".to_owned(),
            ));
        }
        if let Some(queue) = state.transaction.as_mut()
            && name != "exec"
            && name != "discard"
        {
            queue.push(argv.to_vec());
            return Gate::Reply(RespFrame::SimpleString("QUEUED".to_owned()));
        }
        Gate::Run
    }

    fn run_command(
        &mut self,
        client: ClientId,
        name: &str,
        argv: &[Vec<u8>],
        now_ms: u64,
        in_exec: bool,
    ) -> Result<Reply, CommandError> {
        let Some(id) = classify_command(name.as_bytes()) else {
            return Err(CommandError::UnknownCommand(name.to_owned()));
        };
        if self.auth_required(client) && id != CommandId::Auth {
            return Err(CommandError::NoAuth);
        }
        // Arg count convention follows the wire protocol: N excludes
        // the command name itself.
        let n = argv.len() - 1;
        let result = match id {
            CommandId::Del => self.cmd_del(client, argv, n),
            CommandId::Dump => self.cmd_dump(client, argv, n),
            CommandId::Exists => self.cmd_exists(client, argv, n),
            CommandId::Expire => self.cmd_expire(client, argv, n, 1_000, now_ms),
            CommandId::Pexpire => self.cmd_expire(client, argv, n, 1, now_ms),
            CommandId::Expireat => self.cmd_expireat(client, argv, n, 1_000, now_ms),
            CommandId::Pexpireat => self.cmd_expireat(client, argv, n, 1, now_ms),
            CommandId::Keys => self.cmd_keys(client, argv, n),
            CommandId::Move => self.cmd_move(client, argv, n),
            CommandId::Persist => self.cmd_persist(client, argv, n),
            CommandId::Pttl => self.cmd_ttl(client, argv, n, 1, now_ms),
            CommandId::Ttl => self.cmd_ttl(client, argv, n, 1_000, now_ms),
            CommandId::Randomkey => self.cmd_randomkey(client, argv, n),
            CommandId::Rename => self.cmd_rename(client, argv, n, false),
            CommandId::Renamenx => self.cmd_rename(client, argv, n, true),
            CommandId::Restore => self.cmd_restore(client, argv, n, now_ms),
            CommandId::Sort => self.cmd_sort(client, argv, n),
            CommandId::Type => self.cmd_type(client, argv, n),
            CommandId::Append => self.cmd_append(client, argv, n),
            CommandId::Bitcount => self.cmd_bitcount(client, argv, n),
            CommandId::Bitop => self.cmd_bitop(client, argv, n),
            CommandId::Decr => self.cmd_incr_int(client, argv, n, name, IncrSpec::Fixed(-1)),
            CommandId::Decrby => self.cmd_incr_int(client, argv, n, name, IncrSpec::NegArg),
            CommandId::Get => self.cmd_get(client, argv, n),
            CommandId::Getbit => self.cmd_getbit(client, argv, n),
            CommandId::Getrange => self.cmd_getrange(client, argv, n),
            CommandId::Getset => self.cmd_getset(client, argv, n),
            CommandId::Incr => self.cmd_incr_int(client, argv, n, name, IncrSpec::Fixed(1)),
            CommandId::Incrby => self.cmd_incr_int(client, argv, n, name, IncrSpec::Arg),
            CommandId::Incrbyfloat => self.cmd_incrbyfloat(client, argv, n, name),
            CommandId::Mget => self.cmd_mget(client, argv, n),
            CommandId::Mset => self.cmd_mset(client, argv, n),
            CommandId::Msetnx => self.cmd_msetnx(client, argv, n),
            CommandId::Psetex => self.cmd_setex(client, argv, n, 1, now_ms),
            CommandId::Set => self.cmd_set(client, argv, n, now_ms),
            CommandId::Setbit => self.cmd_setbit(client, argv, n),
            CommandId::Setex => self.cmd_setex(client, argv, n, 1_000, now_ms),
            CommandId::Setnx => self.cmd_setnx(client, argv, n, now_ms),
            CommandId::Setrange => self.cmd_setrange(client, argv, n),
            CommandId::Strlen => self.cmd_strlen(client, argv, n),
            CommandId::Hdel => self.cmd_hdel(client, argv, n),
            CommandId::Hexists => self.cmd_hexists(client, argv, n),
            CommandId::Hget => self.cmd_hget(client, argv, n),
            CommandId::Hgetall => self.cmd_hgetall(client, argv, n),
            CommandId::Hincrby => self.cmd_hincrby_int(client, argv, n),
            CommandId::Hincrbyfloat => self.cmd_hincrby_float(client, argv, n),
            CommandId::Hkeys => self.cmd_hkeys(client, argv, n),
            CommandId::Hlen => self.cmd_hlen(client, argv, n),
            CommandId::Hmget => self.cmd_hmget(client, argv, n),
            CommandId::Hmset => self.cmd_hmset(client, argv, n),
            CommandId::Hset => self.cmd_hset(client, argv, n, false),
            CommandId::Hsetnx => self.cmd_hset(client, argv, n, true),
            CommandId::Hvals => self.cmd_hvals(client, argv, n),
            CommandId::Blpop => {
                self.cmd_bpop(client, argv, n, BlockKind::HeadPop, now_ms, in_exec)
            }
            CommandId::Brpop => {
                self.cmd_bpop(client, argv, n, BlockKind::TailPop, now_ms, in_exec)
            }
            CommandId::Brpoplpush => self.cmd_brpoplpush(client, argv, n, now_ms, in_exec),
            CommandId::Lindex => self.cmd_lindex(client, argv, n),
            CommandId::Linsert => self.cmd_linsert(client, argv, n, now_ms),
            CommandId::Llen => self.cmd_llen(client, argv, n),
            CommandId::Lpop => self.cmd_lpop(client, argv, n, true, now_ms),
            CommandId::Rpop => self.cmd_lpop(client, argv, n, false, now_ms),
            CommandId::Lpush => self.cmd_lpush(client, argv, n, true, false, now_ms),
            CommandId::Rpush => self.cmd_lpush(client, argv, n, false, false, now_ms),
            CommandId::Lpushx => self.cmd_lpush(client, argv, n, true, true, now_ms),
            CommandId::Rpushx => self.cmd_lpush(client, argv, n, false, true, now_ms),
            CommandId::Lrange => self.cmd_lrange(client, argv, n),
            CommandId::Lrem => self.cmd_lrem(client, argv, n, now_ms),
            CommandId::Lset => self.cmd_lset(client, argv, n, now_ms),
            CommandId::Ltrim => self.cmd_ltrim(client, argv, n, now_ms),
            CommandId::Rpoplpush => self.cmd_rpoplpush(client, argv, n, now_ms),
            CommandId::Sadd => self.cmd_sadd(client, argv, n),
            CommandId::Scard => self.cmd_scard(client, argv, n),
            CommandId::Sdiff => self.cmd_setoper(client, argv, n, SetOper::Diff, false),
            CommandId::Sdiffstore => self.cmd_setoper(client, argv, n, SetOper::Diff, true),
            CommandId::Sinter => self.cmd_setoper(client, argv, n, SetOper::Inter, false),
            CommandId::Sinterstore => self.cmd_setoper(client, argv, n, SetOper::Inter, true),
            CommandId::Sismember => self.cmd_sismember(client, argv, n),
            CommandId::Smembers => self.cmd_smembers(client, argv, n),
            CommandId::Smove => self.cmd_smove(client, argv, n),
            CommandId::Spop => self.cmd_spop(client, argv, n),
            CommandId::Srandmember => self.cmd_srandmember(client, argv, n),
            CommandId::Srem => self.cmd_srem(client, argv, n),
            CommandId::Sunion => self.cmd_setoper(client, argv, n, SetOper::Union, false),
            CommandId::Sunionstore => self.cmd_setoper(client, argv, n, SetOper::Union, true),
            CommandId::Zadd => self.cmd_zadd(client, argv, n),
            CommandId::Zcard => self.cmd_zcard(client, argv, n),
            CommandId::Zcount => self.cmd_zcount(client, argv, n),
            CommandId::Zincrby => self.cmd_zincrby(client, argv, n),
            CommandId::Zinterstore => self.cmd_zsetoper(client, argv, n, false),
            CommandId::Zunionstore => self.cmd_zsetoper(client, argv, n, true),
            CommandId::Zrange => self.cmd_zrange(client, argv, n),
            CommandId::Zrangebyscore => self.cmd_zrangebyscore(client, argv, n),
            CommandId::Zrank => self.cmd_zrank(client, argv, n),
            CommandId::Zrem => self.cmd_zrem(client, argv, n),
            CommandId::Zremrangebyrank => self.cmd_zremrangebyrank(client, argv, n),
            CommandId::Zremrangebyscore => self.cmd_zremrangebyscore(client, argv, n),
            CommandId::Zscore => self.cmd_zscore(client, argv, n),
            CommandId::Psubscribe => self.cmd_psubscribe(client, argv, n),
            CommandId::Publish => self.cmd_publish(client, argv, n),
            CommandId::Pubsub => self.cmd_pubsub(client, argv, n),
            CommandId::Punsubscribe => self.cmd_punsubscribe(client, argv, n),
            CommandId::Subscribe => self.cmd_subscribe(client, argv, n),
            CommandId::Unsubscribe => self.cmd_unsubscribe(client, argv, n),
            CommandId::Discard => self.cmd_discard(client, argv, n),
            CommandId::Exec => self.cmd_exec(client, argv, n, now_ms),
            CommandId::Multi => self.cmd_multi(client, argv, n),
            CommandId::Unwatch => self.cmd_unwatch(client, argv, n),
            CommandId::Watch => self.cmd_watch(client, argv, n),
            CommandId::Auth => self.cmd_auth(client, argv, n),
            CommandId::Echo => self.cmd_echo(client, argv, n),
            CommandId::Ping => self.cmd_ping(client, argv, n),
            CommandId::Quit => self.cmd_quit(client, argv, n),
            CommandId::Select => self.cmd_select(client, argv, n),
            CommandId::Bgsave => self.cmd_save(client, argv, n, now_ms),
            CommandId::Client => self.cmd_client(client, argv, n, now_ms),
            CommandId::Config => self.cmd_config(client, argv, n),
            CommandId::Dbsize => self.cmd_dbsize(client, argv, n),
            CommandId::Flushall => self.cmd_flushall(client, argv, n),
            CommandId::Flushdb => self.cmd_flushdb(client, argv, n),
            CommandId::Info => self.cmd_info(client, argv, n, now_ms),
            CommandId::Lastsave => Reply::int((self.last_save_ms / 1_000) as i64),
            CommandId::Monitor => self.cmd_monitor(client, argv, n),
            CommandId::Save => self.cmd_save(client, argv, n, now_ms),
            CommandId::Time => self.cmd_time(argv, n, now_ms),
            CommandId::Unsupported => Err(CommandError::NotSupported),
        };
        // Arity failures report the command the client actually typed
        // (RENAMENX, not its shared RENAME handler, and so on).
        result.map_err(|err| match err {
            CommandError::WrongArity(_) => CommandError::WrongArity(name.to_owned()),
            other => other,
        })
    }

    fn auth_required(&self, client: ClientId) -> bool {
        let Some(configured) = self.config.password.as_deref() else {
            return false;
        };
        self.clients
            .get(&client)
            .is_none_or(|state| state.given_password != configured)
    }

    // ---------------------------------------------------------------
    // Shared plumbing

    fn state(&self, client: ClientId) -> Result<&ClientState, CommandError> {
        self.clients
            .get(&client)
            .ok_or_else(|| CommandError::Internal("unknown client".to_owned()))
    }

    fn state_mut(&mut self, client: ClientId) -> Result<&mut ClientState, CommandError> {
        self.clients
            .get_mut(&client)
            .ok_or_else(|| CommandError::Internal("unknown client".to_owned()))
    }

    fn db_index(&self, client: ClientId) -> Result<usize, CommandError> {
        Ok(self.state(client)?.db_index)
    }

    fn client_db(&mut self, client: ClientId) -> Result<&mut Db, CommandError> {
        let index = self.db_index(client)?;
        Ok(&mut self.dbs[index])
    }

    /// Write signal: bump the dirty counter and flag DIRTY_CAS on every
    /// watcher whose watched set covers the key (`None` flags all).
    fn signal(&mut self, key: Option<&[u8]>, dirty: u64) {
        self.dirty += dirty;
        for id in &self.watching {
            if let Some(state) = self.clients.get_mut(id) {
                let hit = match key {
                    None => true,
                    Some(key) => state
                        .watched_keys
                        .as_ref()
                        .is_some_and(|watched| watched.contains(key)),
                };
                if hit {
                    state.dirty_cas = true;
                }
            }
        }
    }

    /// List-write signal: everything `signal` does, plus serving
    /// blocked waiters FIFO while the key still holds data. A producer
    /// that pushes several elements can satisfy several waiters in one
    /// event; the popped element goes to the originally-blocked
    /// connection, never the pusher.
    fn signal_list(&mut self, db_idx: usize, key: &[u8], dirty: u64, now_ms: u64) {
        self.signal(Some(key), dirty);
        loop {
            let ready = matches!(
                self.dbs[db_idx].peek(key),
                Some(Value::List(list)) if !list.is_empty()
            );
            if !ready {
                return;
            }
            let Some(waiter) = self.dbs[db_idx].pop_waiter(key) else {
                return;
            };
            // A stale queue entry (client already served elsewhere or
            // gone) is skipped.
            let Some(blocked) = self
                .clients
                .get_mut(&waiter)
                .and_then(|state| state.blocked.take())
            else {
                continue;
            };
            for registered in &blocked.keys {
                self.dbs[db_idx].remove_waiter(registered, waiter);
            }
            if let Some(timer) = blocked.timer {
                self.timers.cancel(timer);
            }
            self.blocked_clients = self.blocked_clients.saturating_sub(1);
            match self.pop_now(db_idx, blocked.kind, key, blocked.dest.as_deref(), now_ms) {
                Ok(Some(frame)) => self.outbox.push((waiter, frame)),
                Ok(None) => self.outbox.push((waiter, RespFrame::null_array())),
                Err(err) => self.outbox.push((waiter, err.to_frame())),
            }
        }
    }

    /// The pop shared by BLPOP/BRPOP/BRPOPLPUSH (immediate and
    /// deferred) and RPOPLPUSH: pop from `key`, optionally push into
    /// `dest`, emit signals, build the reply frame.
    fn pop_now(
        &mut self,
        db_idx: usize,
        kind: BlockKind,
        key: &[u8],
        dest: Option<&[u8]>,
        now_ms: u64,
    ) -> Result<Option<RespFrame>, CommandError> {
        if kind == BlockKind::TailPopPush {
            if let Some(dest) = dest {
                match self.dbs[db_idx].peek(dest) {
                    None => {
                        self.dbs[db_idx]
                            .insert_data(dest.to_vec(), Value::List(VecDeque::new()));
                    }
                    Some(Value::List(_)) => {}
                    Some(_) => return Err(CommandError::WrongType),
                }
            }
        }
        let elem = match self.dbs[db_idx].get_mut(key) {
            Some(Value::List(list)) => match kind {
                BlockKind::HeadPop => list.pop_front(),
                BlockKind::TailPop | BlockKind::TailPopPush => list.pop_back(),
            },
            Some(_) => return Err(CommandError::WrongType),
            None => return Ok(None),
        };
        let Some(elem) = elem else {
            return Ok(None);
        };
        self.signal(Some(key), 1);
        if let Some(dest) = dest {
            if let Some(Value::List(list)) = self.dbs[db_idx].get_mut(dest) {
                list.push_front(elem.clone());
            }
            self.signal_list(db_idx, dest, 1, now_ms);
        }
        self.drop_if_spent(db_idx, key);
        let reply = match dest {
            Some(_) => RespFrame::bulk(elem),
            None => RespFrame::array(vec![RespFrame::bulk(key.to_vec()), RespFrame::bulk(elem)]),
        };
        Ok(Some(reply))
    }

    /// Cull a collection key that just became empty.
    fn drop_if_spent(&mut self, db_idx: usize, key: &[u8]) {
        let spent = self.dbs[db_idx]
            .peek(key)
            .is_some_and(Value::is_spent);
        if spent {
            if let Some((_, Some(timer))) = self.dbs[db_idx].pop(key) {
                self.timers.cancel(timer);
            }
            self.signal(Some(key), 0);
        }
    }

    fn block_timed_out(&mut self, client: ClientId) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let Some(blocked) = state.blocked.take() else {
            return;
        };
        let db = state.db_index;
        for key in &blocked.keys {
            self.dbs[db].remove_waiter(key, client);
        }
        self.blocked_clients = self.blocked_clients.saturating_sub(1);
        self.outbox.push((client, RespFrame::null_array()));
    }

    /// Remove a key entirely, cancelling its eviction timer.
    fn remove_key(&mut self, db_idx: usize, key: &[u8]) -> Option<Value> {
        let (value, timer) = self.dbs[db_idx].pop(key)?;
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        Some(value)
    }

    /// Arm (or re-arm) an eviction timer for a key. `false` when the
    /// key does not exist.
    fn arm_key_expiry(&mut self, db_idx: usize, key: &[u8], deadline_ms: u64) -> bool {
        let timer = self.timers.schedule(
            deadline_ms,
            TimerEvent::ExpireKey { db: db_idx, key: key.to_vec() },
        );
        match self.dbs[db_idx].arm_expire(key, timer, deadline_ms) {
            Some(old) => {
                if let Some(old) = old {
                    self.timers.cancel(old);
                }
                true
            }
            None => {
                self.timers.cancel(timer);
                false
            }
        }
    }

    fn next_rand(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    fn rand_index(&mut self, len: usize) -> usize {
        if len == 0 { 0 } else { (self.next_rand() % len as u64) as usize }
    }

    fn feed_monitors(&mut self, source: ClientId, argv: &[Vec<u8>], now_ms: u64) {
        let db = self
            .clients
            .get(&source)
            .map(|state| state.db_index)
            .unwrap_or(0);
        let addr = self
            .clients
            .get(&source)
            .map(|state| state.addr.clone())
            .unwrap_or_default();
        let mut line = format!(
            "{}.{:06} [{} {}]",
            now_ms / 1_000,
            (now_ms % 1_000) * 1_000,
            db,
            addr
        );
        for arg in argv {
            line.push_str(" \"");
            line.push_str(&String::from_utf8_lossy(arg));
            line.push('"');
        }
        let monitors: Vec<ClientId> = self.monitors.iter().copied().collect();
        for monitor in monitors {
            self.outbox
                .push((monitor, RespFrame::SimpleString(line.clone())));
        }
    }

    // ---------------------------------------------------------------
    // Keys

    fn cmd_del(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("del", n == 0)?;
        let db_idx = self.db_index(client)?;
        let mut removed = 0;
        for key in &argv[1..] {
            match self.dbs[db_idx].rem(key) {
                Some(timer) => {
                    if let Some(timer) = timer {
                        self.timers.cancel(timer);
                    }
                    self.signal(Some(key), 1);
                    removed += 1;
                }
                None => {}
            }
        }
        Reply::int(removed)
    }

    fn cmd_dump(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("dump", n != 1)?;
        let db = self.client_db(client)?;
        match db.get(&argv[1]) {
            Some(value) => Reply::bulk(qs_persist::encode_value_blob(&value.to_snapshot())),
            None => Reply::null(),
        }
    }

    fn cmd_exists(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("exists", n != 1)?;
        let exists = self.client_db(client)?.exists(&argv[1]);
        Reply::int(if exists { 1 } else { 0 })
    }

    fn cmd_expire(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        unit_ms: u64,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("expire", n != 2)?;
        let Some(timeout) = parse_i64(&argv[2]) else {
            return Err(CommandError::InvalidTimeout);
        };
        if timeout == 0 {
            return Reply::int(0);
        }
        if timeout < 0 {
            return Err(CommandError::InvalidTimeout);
        }
        let db_idx = self.db_index(client)?;
        let deadline = now_ms.saturating_add(timeout as u64 * unit_ms);
        if self.arm_key_expiry(db_idx, &argv[1], deadline) {
            Reply::int(1)
        } else {
            Reply::int(0)
        }
    }

    fn cmd_expireat(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        unit_ms: u64,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("expireat", n != 2)?;
        let Some(at) = parse_i64(&argv[2]) else {
            return Err(CommandError::InvalidTimeout);
        };
        if at == 0 {
            return Reply::int(0);
        }
        if at < 0 {
            return Err(CommandError::InvalidTimeout);
        }
        let db_idx = self.db_index(client)?;
        let deadline = (at as u64).saturating_mul(unit_ms).max(now_ms);
        if self.arm_key_expiry(db_idx, &argv[1], deadline) {
            Reply::int(1)
        } else {
            Reply::int(0)
        }
    }

    fn cmd_keys(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("keys", n != 1)?;
        let pattern = &argv[1];
        let all = pattern.as_slice() == b"*";
        let db = self.client_db(client)?;
        let keys: Vec<RespFrame> = db
            .keys()
            .filter(|key| all || glob_match(pattern, key))
            .map(|key| RespFrame::bulk(key.to_vec()))
            .collect();
        Reply::frame(RespFrame::array(keys))
    }

    fn cmd_move(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("move", n != 2)?;
        let target = parse_i64(&argv[2])
            .and_then(|idx| usize::try_from(idx).ok())
            .filter(|idx| *idx < self.dbs.len());
        let Some(target) = target else {
            return Err(CommandError::Custom("index out of range".to_owned()));
        };
        let db_idx = self.db_index(client)?;
        let key = &argv[1];
        if self.dbs[target].exists(key) || !self.dbs[db_idx].exists(key) {
            return Reply::int(0);
        }
        let Some(value) = self.remove_key(db_idx, key) else {
            return Reply::int(0);
        };
        self.signal(Some(key), 1);
        self.dbs[target].insert_data(key.clone(), value);
        self.signal(Some(key), 1);
        Reply::int(1)
    }

    fn cmd_persist(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("persist", n != 1)?;
        let timer = self.client_db(client)?.persist(&argv[1]);
        match timer {
            Some(timer) => {
                self.timers.cancel(timer);
                Reply::int(1)
            }
            None => Reply::int(0),
        }
    }

    fn cmd_ttl(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        unit_ms: u64,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("ttl", n != 1)?;
        match self.client_db(client)?.ttl(&argv[1], now_ms) {
            Ttl::Missing => Reply::int(-2),
            Ttl::NoExpiry => Reply::int(-1),
            Ttl::Remaining(ms) => Reply::int((ms / unit_ms) as i64),
        }
    }

    fn cmd_randomkey(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("randomkey", n != 0)?;
        let _ = argv;
        let db_idx = self.db_index(client)?;
        let keys: Vec<Vec<u8>> = self.dbs[db_idx].keys().map(<[u8]>::to_vec).collect();
        if keys.is_empty() {
            return Reply::null();
        }
        let pick = self.rand_index(keys.len());
        Reply::bulk(keys[pick].clone())
    }

    fn cmd_rename(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        nx: bool,
    ) -> Result<Reply, CommandError> {
        check_input("rename", n != 2)?;
        let db_idx = self.db_index(client)?;
        let (key, newkey) = (&argv[1], &argv[2]);
        if !self.dbs[db_idx].exists(key) {
            self.dbs[db_idx].get(key);
            return Err(CommandError::Custom(
                "Cannot rename key, not available".to_owned(),
            ));
        }
        if key == newkey {
            return Err(CommandError::Custom("Cannot rename key".to_owned()));
        }
        if nx {
            if self.dbs[db_idx].exists(newkey) {
                return Reply::int(0);
            }
        } else if self.remove_key(db_idx, newkey).is_some() {
            self.signal(Some(newkey), 0);
        }
        let Some(value) = self.remove_key(db_idx, key) else {
            return Err(CommandError::Internal("rename lost the key".to_owned()));
        };
        self.dbs[db_idx].insert_data(newkey.clone(), value);
        self.signal(Some(newkey), 1);
        if nx { Reply::int(1) } else { Reply::ok() }
    }

    fn cmd_restore(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("restore", n != 3)?;
        let Some(ttl) = parse_i64(&argv[2]) else {
            return Err(CommandError::InvalidTimeout);
        };
        let value = match qs_persist::decode_value_blob(&argv[3]) {
            Ok(snapshot) => Value::from_snapshot(snapshot),
            Err(_) => {
                return Err(CommandError::Custom("Could not decode value".to_owned()));
            }
        };
        let db_idx = self.db_index(client)?;
        let key = &argv[1];
        if self.remove_key(db_idx, key).is_some() {
            self.signal(Some(key), 0);
        }
        self.dbs[db_idx].insert_data(key.clone(), value);
        self.signal(Some(key), 1);
        if ttl > 0 {
            let deadline = now_ms.saturating_add(ttl as u64 * 1_000);
            self.arm_key_expiry(db_idx, key, deadline);
        }
        Reply::ok()
    }

    fn cmd_sort(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("sort", n == 0)?;
        let db_idx = self.db_index(client)?;
        sort::sort_command(self, db_idx, argv)
    }

    fn cmd_type(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("type", n != 1)?;
        let name = match self.client_db(client)?.get(&argv[1]) {
            Some(value) => value.type_name(),
            None => "none",
        };
        Reply::frame(RespFrame::SimpleString(name.to_owned()))
    }

    // ---------------------------------------------------------------
    // Strings

    /// `&mut Value::Str` for a key, creating it empty when missing.
    fn string_entry<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<&'a mut Vec<u8>, CommandError> {
        match db.get_or_insert_with(key, || Value::Str(Vec::new())) {
            Value::Str(bytes) => Ok(bytes),
            _ => Err(CommandError::WrongType),
        }
    }

    fn read_string<'a>(db: &'a mut Db, key: &[u8]) -> Result<Option<&'a Vec<u8>>, CommandError> {
        match db.get(key) {
            None => Ok(None),
            Some(Value::Str(bytes)) => Ok(Some(bytes)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_append(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("append", n != 2)?;
        let db_idx = self.db_index(client)?;
        let len = {
            let bytes = Self::string_entry(&mut self.dbs[db_idx], &argv[1])?;
            bytes.extend_from_slice(&argv[2]);
            bytes.len()
        };
        self.signal(Some(&argv[1]), 1);
        Reply::int(len as i64)
    }

    fn cmd_bitcount(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("bitcount", !(1..=3).contains(&n))?;
        let db = self.client_db(client)?;
        let Some(bytes) = Self::read_string(db, &argv[1])? else {
            return Reply::int(0);
        };
        let slice: &[u8] = if n > 1 {
            let start = parse_i64(&argv[2]).ok_or(CommandError::Syntax)?;
            let end = if n == 3 {
                parse_i64(&argv[3]).ok_or(CommandError::Syntax)?
            } else {
                -1
            };
            let (start, end) = resolve_range(bytes.len(), start, end);
            &bytes[start..end]
        } else {
            bytes
        };
        let count: u32 = slice.iter().map(|byte| byte.count_ones()).sum();
        Reply::int(i64::from(count))
    }

    fn cmd_bitop(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("bitop", n < 3)?;
        let op = argv[1].to_ascii_lowercase();
        if op == b"not" {
            check_input("bitop", n != 3)?;
        } else if !matches!(op.as_slice(), b"and" | b"or" | b"xor") {
            return Err(CommandError::Custom("bad command".to_owned()));
        }
        let db_idx = self.db_index(client)?;
        let mut sources: Vec<Vec<u8>> = Vec::new();
        for key in &argv[3..] {
            match self.dbs[db_idx].get(key) {
                None => sources.push(Vec::new()),
                Some(Value::Str(bytes)) => sources.push(bytes.clone()),
                Some(_) => return Err(CommandError::WrongType),
            }
        }
        let result = match op.as_slice() {
            b"not" => sources
                .first()
                .map(|bytes| bytes.iter().map(|byte| !byte).collect())
                .unwrap_or_default(),
            _ => {
                let longest = sources.iter().map(Vec::len).max().unwrap_or(0);
                let mut out = Vec::with_capacity(longest);
                for i in 0..longest {
                    let mut acc: Option<u8> = None;
                    for source in &sources {
                        let byte = source.get(i).copied().unwrap_or(0);
                        acc = Some(match (acc, op.as_slice()) {
                            (None, _) => byte,
                            (Some(prev), b"and") => prev & byte,
                            (Some(prev), b"or") => prev | byte,
                            (Some(prev), _) => prev ^ byte,
                        });
                    }
                    out.push(acc.unwrap_or(0));
                }
                out
            }
        };
        if result.is_empty() {
            return Reply::int(0);
        }
        let dest = &argv[2];
        if self.remove_key(db_idx, dest).is_some() {
            self.signal(Some(dest), 0);
        }
        let len = result.len();
        self.dbs[db_idx].insert_data(dest.clone(), Value::Str(result));
        self.signal(Some(dest), 1);
        Reply::int(len as i64)
    }

    fn cmd_get(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("get", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_string(db, &argv[1])? {
            Some(bytes) => Reply::bulk(bytes.clone()),
            None => Reply::null(),
        }
    }

    fn cmd_getbit(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("getbit", n != 2)?;
        let offset = parse_bit_offset(&argv[2])?;
        let db = self.client_db(client)?;
        let Some(bytes) = Self::read_string(db, &argv[1])? else {
            return Reply::int(0);
        };
        let byte = offset >> 3;
        if byte >= bytes.len() {
            return Reply::int(0);
        }
        let bit = 7 - (offset & 7);
        Reply::int(i64::from(bytes[byte] >> bit & 1))
    }

    fn cmd_getrange(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("getrange", n != 3)?;
        let start = parse_i64(&argv[2]);
        let end = parse_i64(&argv[3]);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(CommandError::Custom(format!(
                "Wrong offset in '{}' command",
                String::from_utf8_lossy(&argv[0])
            )));
        };
        let db = self.client_db(client)?;
        let Some(bytes) = Self::read_string(db, &argv[1])? else {
            return Reply::bulk(Vec::new());
        };
        let (start, end) = resolve_range(bytes.len(), start, end);
        Reply::bulk(bytes[start..end].to_vec())
    }

    fn cmd_getset(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("getset", n != 2)?;
        let db_idx = self.db_index(client)?;
        let previous = match self.dbs[db_idx].get(&argv[1]) {
            Some(Value::Str(bytes)) => Some(bytes.clone()),
            Some(_) => return Err(CommandError::WrongType),
            None => None,
        };
        self.remove_key(db_idx, &argv[1]);
        self.dbs[db_idx].insert_data(argv[1].clone(), Value::Str(argv[2].clone()));
        self.signal(Some(&argv[1]), 1);
        match previous {
            Some(bytes) => Reply::bulk(bytes),
            None => Reply::null(),
        }
    }

    fn cmd_incr_int(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        name: &str,
        mode: IncrSpec,
    ) -> Result<Reply, CommandError> {
        match mode {
            IncrSpec::Fixed(_) => check_input(name, n != 1)?,
            IncrSpec::Arg | IncrSpec::NegArg => check_input(name, n != 2)?,
        }
        let delta = match mode {
            IncrSpec::Fixed(delta) => delta,
            IncrSpec::Arg => parse_i64(&argv[2])
                .ok_or_else(|| CommandError::Custom("invalid increment".to_owned()))?,
            IncrSpec::NegArg => parse_i64(&argv[2])
                .and_then(i64::checked_neg)
                .ok_or_else(|| CommandError::Custom("invalid increment".to_owned()))?,
        };
        let db_idx = self.db_index(client)?;
        let key = &argv[1];
        let current = match self.dbs[db_idx].get(key) {
            Some(Value::Str(bytes)) => parse_i64(bytes)
                .ok_or_else(|| CommandError::Custom("invalid increment".to_owned()))?,
            Some(_) => return Err(CommandError::WrongType),
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            CommandError::Custom("increment or decrement would overflow".to_owned())
        })?;
        match self.dbs[db_idx].get_mut(key) {
            Some(Value::Str(bytes)) => *bytes = next.to_string().into_bytes(),
            _ => self.dbs[db_idx]
                .insert_data(key.clone(), Value::Str(next.to_string().into_bytes())),
        }
        self.signal(Some(key), 1);
        Reply::int(next)
    }

    fn cmd_incrbyfloat(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        name: &str,
    ) -> Result<Reply, CommandError> {
        check_input(name, n != 2)?;
        let delta = parse_f64(&argv[2])
            .ok_or_else(|| CommandError::Custom("invalid increment".to_owned()))?;
        let db_idx = self.db_index(client)?;
        let key = &argv[1];
        let current = match self.dbs[db_idx].get(key) {
            Some(Value::Str(bytes)) => parse_f64(bytes)
                .ok_or_else(|| CommandError::Custom("invalid increment".to_owned()))?,
            Some(_) => return Err(CommandError::WrongType),
            None => 0.0,
        };
        let next = current + delta;
        let rendered = fmt_f64(next);
        match self.dbs[db_idx].get_mut(key) {
            Some(Value::Str(bytes)) => *bytes = rendered.clone(),
            _ => self.dbs[db_idx].insert_data(key.clone(), Value::Str(rendered.clone())),
        }
        self.signal(Some(key), 1);
        Reply::bulk(rendered)
    }

    fn cmd_mget(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("mget", n == 0)?;
        let db = self.client_db(client)?;
        let mut values = Vec::with_capacity(n);
        for key in &argv[1..] {
            match db.get(key) {
                None => values.push(RespFrame::null()),
                Some(Value::Str(bytes)) => values.push(RespFrame::bulk(bytes.clone())),
                Some(_) => return Err(CommandError::WrongType),
            }
        }
        Reply::frame(RespFrame::array(values))
    }

    fn cmd_mset(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("mset", n < 2 || n % 2 != 0)?;
        let db_idx = self.db_index(client)?;
        for pair in argv[1..].chunks(2) {
            self.remove_key(db_idx, &pair[0]);
            self.dbs[db_idx].insert_data(pair[0].clone(), Value::Str(pair[1].clone()));
            self.signal(Some(&pair[0]), 1);
        }
        Reply::ok()
    }

    fn cmd_msetnx(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("msetnx", n < 2 || n % 2 != 0)?;
        let db_idx = self.db_index(client)?;
        let any_exists = argv[1..]
            .chunks(2)
            .any(|pair| self.dbs[db_idx].exists(&pair[0]));
        if any_exists {
            return Reply::int(0);
        }
        for pair in argv[1..].chunks(2) {
            self.dbs[db_idx].insert_data(pair[0].clone(), Value::Str(pair[1].clone()));
            self.signal(Some(&pair[0]), 1);
        }
        Reply::int(1)
    }

    fn cmd_set(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("set", !(2..=8).contains(&n))?;
        let mut ttl_ms: u64 = 0;
        let mut nx = false;
        let mut xx = false;
        let mut options = argv[3..].iter();
        while let Some(option) = options.next() {
            match option.to_ascii_lowercase().as_slice() {
                b"ex" => {
                    let seconds = options.next().and_then(|arg| parse_i64(arg));
                    match seconds {
                        Some(seconds) if seconds >= 0 => ttl_ms = seconds as u64 * 1_000,
                        _ => return Err(CommandError::InvalidTimeout),
                    }
                }
                b"px" => {
                    let millis = options.next().and_then(|arg| parse_i64(arg));
                    match millis {
                        Some(millis) if millis >= 0 => ttl_ms = millis as u64,
                        _ => return Err(CommandError::InvalidTimeout),
                    }
                }
                b"nx" => nx = true,
                b"xx" => xx = true,
                _ => {}
            }
        }
        if self.set_string(client, &argv[1], argv[2].clone(), ttl_ms, nx, xx, now_ms)? {
            Reply::ok()
        } else {
            Reply::null()
        }
    }

    /// Shared SET core: handles NX/XX skipping and TTL arming. Returns
    /// whether the write happened.
    fn set_string(
        &mut self,
        client: ClientId,
        key: &[u8],
        value: Vec<u8>,
        ttl_ms: u64,
        nx: bool,
        xx: bool,
        now_ms: u64,
    ) -> Result<bool, CommandError> {
        let db_idx = self.db_index(client)?;
        let exists = self.dbs[db_idx].exists(key);
        if (exists && nx) || (!exists && xx) {
            return Ok(false);
        }
        self.remove_key(db_idx, key);
        self.dbs[db_idx].insert_data(key.to_vec(), Value::Str(value));
        if ttl_ms > 0 {
            self.arm_key_expiry(db_idx, key, now_ms.saturating_add(ttl_ms));
            self.signal(Some(key), 0);
        }
        self.signal(Some(key), 1);
        Ok(true)
    }

    fn cmd_setbit(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("setbit", n != 3)?;
        let offset = parse_bit_offset(&argv[2])?;
        let bit_value = match parse_i64(&argv[3]) {
            Some(0) => 0,
            Some(1) => 1,
            _ => {
                return Err(CommandError::Custom(
                    "bit is not an integer or out of range".to_owned(),
                ));
            }
        };
        let db_idx = self.db_index(client)?;
        let previous = {
            let bytes = Self::string_entry(&mut self.dbs[db_idx], &argv[1])?;
            let byte = offset >> 3;
            if byte >= bytes.len() {
                bytes.resize(byte + 1, 0);
            }
            let bit = 7 - (offset & 7);
            let previous = bytes[byte] >> bit & 1;
            bytes[byte] = bytes[byte] & !(1 << bit) | (bit_value << bit);
            previous
        };
        self.signal(Some(&argv[1]), 1);
        Reply::int(i64::from(previous))
    }

    fn cmd_setex(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        unit_ms: u64,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("setex", n != 3)?;
        let ttl = parse_i64(&argv[2]).ok_or(CommandError::InvalidTimeout)?;
        if ttl < 0 {
            return Err(CommandError::InvalidTimeout);
        }
        self.set_string(
            client,
            &argv[1],
            argv[3].clone(),
            ttl as u64 * unit_ms,
            false,
            false,
            now_ms,
        )?;
        Reply::ok()
    }

    fn cmd_setnx(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("setnx", n != 2)?;
        let written = self.set_string(
            client,
            &argv[1],
            argv[2].clone(),
            0,
            true,
            false,
            now_ms,
        )?;
        Reply::int(if written { 1 } else { 0 })
    }

    fn cmd_setrange(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("setrange", n != 3)?;
        let offset = parse_i64(&argv[2])
            .and_then(|raw| usize::try_from(raw).ok())
            .ok_or_else(|| {
                CommandError::Custom(format!(
                    "Wrong offset in '{}' command",
                    String::from_utf8_lossy(&argv[0])
                ))
            })?;
        let db_idx = self.db_index(client)?;
        let len = {
            let bytes = Self::string_entry(&mut self.dbs[db_idx], &argv[1])?;
            let end = offset + argv[3].len();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[offset..end].copy_from_slice(&argv[3]);
            bytes.len()
        };
        self.signal(Some(&argv[1]), 1);
        Reply::int(len as i64)
    }

    fn cmd_strlen(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("strlen", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_string(db, &argv[1])? {
            Some(bytes) => Reply::int(bytes.len() as i64),
            None => Reply::int(0),
        }
    }

    // ---------------------------------------------------------------
    // Hashes

    fn hash_entry<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<&'a mut HashMap<Vec<u8>, Vec<u8>>, CommandError> {
        match db.get_or_insert_with(key, || Value::Hash(HashMap::new())) {
            Value::Hash(map) => Ok(map),
            _ => Err(CommandError::WrongType),
        }
    }

    fn read_hash<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<Option<&'a HashMap<Vec<u8>, Vec<u8>>>, CommandError> {
        match db.get(key) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(Some(map)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_hdel(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hdel", n < 2)?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::Hash(map)) => {
                argv[2..].iter().filter(|field| map.remove(*field).is_some()).count()
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        self.signal(Some(&argv[1]), removed as u64);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    fn cmd_hexists(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hexists", n != 2)?;
        let db = self.client_db(client)?;
        match Self::read_hash(db, &argv[1])? {
            None => Reply::int(0),
            Some(map) => Reply::int(i64::from(map.contains_key(&argv[2]))),
        }
    }

    fn cmd_hget(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hget", n != 2)?;
        let db = self.client_db(client)?;
        match Self::read_hash(db, &argv[1])? {
            None => Reply::null(),
            Some(map) => match map.get(&argv[2]) {
                Some(value) => Reply::bulk(value.clone()),
                None => Reply::null(),
            },
        }
    }

    fn cmd_hgetall(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hgetall", n != 1)?;
        let db = self.client_db(client)?;
        let mut flat = Vec::new();
        if let Some(map) = Self::read_hash(db, &argv[1])? {
            for (field, value) in map {
                flat.push(RespFrame::bulk(field.clone()));
                flat.push(RespFrame::bulk(value.clone()));
            }
        }
        Reply::frame(RespFrame::array(flat))
    }

    fn cmd_hincrby_int(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hincrby", n != 3)?;
        let delta = parse_i64(&argv[3]).ok_or_else(|| {
            CommandError::Custom("value is not an integer or out of range".to_owned())
        })?;
        let db_idx = self.db_index(client)?;
        let next = {
            let map = Self::hash_entry(&mut self.dbs[db_idx], &argv[1])?;
            let current = match map.get(&argv[2]) {
                Some(raw) => parse_i64(raw).ok_or_else(|| {
                    CommandError::Custom("hash value is not an integer".to_owned())
                })?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or_else(|| {
                CommandError::Custom("increment or decrement would overflow".to_owned())
            })?;
            map.insert(argv[2].clone(), next.to_string().into_bytes());
            next
        };
        self.signal(Some(&argv[1]), 1);
        Reply::int(next)
    }

    fn cmd_hincrby_float(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hincrbyfloat", n != 3)?;
        let delta = parse_f64(&argv[3]).ok_or_else(|| {
            CommandError::Custom("value is not a float or out of range".to_owned())
        })?;
        let db_idx = self.db_index(client)?;
        let rendered = {
            let map = Self::hash_entry(&mut self.dbs[db_idx], &argv[1])?;
            let current = match map.get(&argv[2]) {
                Some(raw) => parse_f64(raw).ok_or_else(|| {
                    CommandError::Custom("hash value is not a float".to_owned())
                })?,
                None => 0.0,
            };
            let rendered = fmt_f64(current + delta);
            map.insert(argv[2].clone(), rendered.clone());
            rendered
        };
        self.signal(Some(&argv[1]), 1);
        Reply::bulk(rendered)
    }

    fn cmd_hkeys(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hkeys", n != 1)?;
        let db = self.client_db(client)?;
        let fields = match Self::read_hash(db, &argv[1])? {
            None => Vec::new(),
            Some(map) => map.keys().map(|field| RespFrame::bulk(field.clone())).collect(),
        };
        Reply::frame(RespFrame::array(fields))
    }

    fn cmd_hlen(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hlen", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_hash(db, &argv[1])? {
            None => Reply::int(0),
            Some(map) => Reply::int(map.len() as i64),
        }
    }

    fn cmd_hmget(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hmget", n < 2)?;
        let db = self.client_db(client)?;
        let map = Self::read_hash(db, &argv[1])?;
        let values = argv[2..]
            .iter()
            .map(|field| match map.and_then(|map| map.get(field)) {
                Some(value) => RespFrame::bulk(value.clone()),
                None => RespFrame::null(),
            })
            .collect();
        Reply::frame(RespFrame::array(values))
    }

    fn cmd_hmset(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hmset", n < 3 || (n - 1) % 2 != 0)?;
        let db_idx = self.db_index(client)?;
        {
            let map = Self::hash_entry(&mut self.dbs[db_idx], &argv[1])?;
            for pair in argv[2..].chunks(2) {
                map.insert(pair[0].clone(), pair[1].clone());
            }
        }
        self.signal(Some(&argv[1]), ((n - 1) / 2) as u64);
        Reply::ok()
    }

    fn cmd_hset(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        nx: bool,
    ) -> Result<Reply, CommandError> {
        check_input("hset", n != 3)?;
        let db_idx = self.db_index(client)?;
        let (wrote, existed) = {
            let map = Self::hash_entry(&mut self.dbs[db_idx], &argv[1])?;
            let existed = map.contains_key(&argv[2]);
            if nx && existed {
                (false, existed)
            } else {
                map.insert(argv[2].clone(), argv[3].clone());
                (true, existed)
            }
        };
        if wrote {
            self.signal(Some(&argv[1]), 1);
        }
        Reply::int(if existed { 0 } else { 1 })
    }

    fn cmd_hvals(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("hvals", n != 1)?;
        let db = self.client_db(client)?;
        let values = match Self::read_hash(db, &argv[1])? {
            None => Vec::new(),
            Some(map) => map.values().map(|value| RespFrame::bulk(value.clone())).collect(),
        };
        Reply::frame(RespFrame::array(values))
    }

    // ---------------------------------------------------------------
    // Lists

    fn list_entry<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<&'a mut VecDeque<Vec<u8>>, CommandError> {
        match db.get_or_insert_with(key, || Value::List(VecDeque::new())) {
            Value::List(list) => Ok(list),
            _ => Err(CommandError::WrongType),
        }
    }

    fn read_list<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<Option<&'a VecDeque<Vec<u8>>>, CommandError> {
        match db.get(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_bpop(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        kind: BlockKind,
        now_ms: u64,
        in_exec: bool,
    ) -> Result<Reply, CommandError> {
        check_input("blpop", n < 2)?;
        let timeout_s = parse_i64(&argv[argv.len() - 1])
            .map(|t| t.max(0))
            .ok_or(CommandError::Syntax)?;
        let keys: Vec<Vec<u8>> = argv[1..argv.len() - 1].to_vec();
        self.bpop_or_block(client, kind, keys, None, timeout_s, now_ms, in_exec)
    }

    fn cmd_brpoplpush(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
        in_exec: bool,
    ) -> Result<Reply, CommandError> {
        check_input("brpoplpush", n != 3)?;
        let timeout_s = parse_i64(&argv[3])
            .map(|t| t.max(0))
            .ok_or(CommandError::Syntax)?;
        let keys = vec![argv[1].clone()];
        let dest = Some(argv[2].clone());
        self.bpop_or_block(
            client,
            BlockKind::TailPopPush,
            keys,
            dest,
            timeout_s,
            now_ms,
            in_exec,
        )
    }

    /// Try the pop immediately across `keys` in order; register a
    /// `Blocked` waiter when nothing is poppable.
    fn bpop_or_block(
        &mut self,
        client: ClientId,
        kind: BlockKind,
        keys: Vec<Vec<u8>>,
        dest: Option<Vec<u8>>,
        timeout_s: i64,
        now_ms: u64,
        in_exec: bool,
    ) -> Result<Reply, CommandError> {
        let db_idx = self.db_index(client)?;
        for key in &keys {
            match self.dbs[db_idx].peek(key) {
                Some(Value::List(_)) => {
                    return match self.pop_now(
                        db_idx,
                        kind,
                        key,
                        dest.as_deref(),
                        now_ms,
                    )? {
                        Some(frame) => Reply::frame(frame),
                        None => Reply::frame(RespFrame::null_array()),
                    };
                }
                Some(_) => return Err(CommandError::WrongType),
                None => {}
            }
        }
        if in_exec {
            // Blocking inside EXEC degrades to an immediate miss.
            return Reply::frame(RespFrame::null_array());
        }
        for key in &keys {
            self.dbs[db_idx].push_waiter(key, client);
        }
        let timer = if timeout_s > 0 {
            Some(self.timers.schedule(
                now_ms + timeout_s as u64 * 1_000,
                TimerEvent::BlockTimeout { client },
            ))
        } else {
            None
        };
        self.blocked_clients += 1;
        self.state_mut(client)?.blocked = Some(Blocked { kind, keys, dest, timer });
        Ok(Reply::Blocked)
    }

    fn cmd_lindex(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("lindex", n != 2)?;
        let index = parse_i64(&argv[2]).ok_or(CommandError::Syntax)?;
        let db = self.client_db(client)?;
        let Some(list) = Self::read_list(db, &argv[1])? else {
            return Reply::null();
        };
        if index >= 0 && (index as usize) < list.len() {
            Reply::bulk(list[index as usize].clone())
        } else {
            Reply::null()
        }
    }

    fn cmd_linsert(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("linsert", n != 4)?;
        let db_idx = self.db_index(client)?;
        let where_ = argv[2].to_ascii_lowercase();
        let inserted = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::List(list)) => {
                let Some(pivot) = list.iter().position(|item| *item == argv[3]) else {
                    return Reply::int(-1);
                };
                match where_.as_slice() {
                    b"before" => list.insert(pivot, argv[4].clone()),
                    b"after" => list.insert(pivot + 1, argv[4].clone()),
                    _ => {
                        return Err(CommandError::Custom(
                            "cannot insert to list".to_owned(),
                        ));
                    }
                }
                list.len()
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        self.signal_list(db_idx, &argv[1], 1, now_ms);
        Reply::int(inserted as i64)
    }

    fn cmd_llen(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("llen", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_list(db, &argv[1])? {
            None => Reply::int(0),
            Some(list) => Reply::int(list.len() as i64),
        }
    }

    fn cmd_lpop(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        from_head: bool,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("lpop", n != 1)?;
        let db_idx = self.db_index(client)?;
        let popped = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::null(),
            Some(Value::List(list)) => {
                if from_head { list.pop_front() } else { list.pop_back() }
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        let Some(popped) = popped else {
            return Reply::null();
        };
        self.signal_list(db_idx, &argv[1], 1, now_ms);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::bulk(popped)
    }

    fn cmd_lpush(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        to_head: bool,
        only_existing: bool,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        if only_existing {
            check_input("lpushx", n != 2)?;
        } else {
            check_input("lpush", n < 2)?;
        }
        let db_idx = self.db_index(client)?;
        if only_existing && !self.dbs[db_idx].exists(&argv[1]) {
            return Reply::int(0);
        }
        let len = {
            let list = Self::list_entry(&mut self.dbs[db_idx], &argv[1])?;
            for item in &argv[2..] {
                if to_head {
                    list.push_front(item.clone());
                } else {
                    list.push_back(item.clone());
                }
            }
            list.len()
        };
        self.signal_list(db_idx, &argv[1], (n - 1) as u64, now_ms);
        Reply::int(len as i64)
    }

    fn cmd_lrange(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("lrange", n != 3)?;
        let start = parse_i64(&argv[2]);
        let end = parse_i64(&argv[3]);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(CommandError::Custom("invalid range".to_owned()));
        };
        let db = self.client_db(client)?;
        let Some(list) = Self::read_list(db, &argv[1])? else {
            return Reply::frame(RespFrame::array(Vec::new()));
        };
        let (start, end) = resolve_range(list.len(), start, end);
        let items = list
            .iter()
            .skip(start)
            .take(end - start)
            .map(|item| RespFrame::bulk(item.clone()))
            .collect();
        Reply::frame(RespFrame::array(items))
    }

    fn cmd_lrem(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("lrem", n != 3)?;
        let count = parse_i64(&argv[2])
            .ok_or_else(|| CommandError::Custom("cannot remove from list".to_owned()))?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::List(list)) => remove_from_list(list, &argv[3], count),
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal_list(db_idx, &argv[1], removed as u64, now_ms);
        }
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    fn cmd_lset(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("lset", n != 3)?;
        let index = parse_i64(&argv[2]).unwrap_or(-1);
        let db_idx = self.db_index(client)?;
        match self.dbs[db_idx].get_mut(&argv[1]) {
            None => Err(CommandError::OutOfBound),
            Some(Value::List(list)) => {
                if index >= 0 && (index as usize) < list.len() {
                    list[index as usize] = argv[3].clone();
                    self.signal_list(db_idx, &argv[1], 1, now_ms);
                    Reply::ok()
                } else {
                    Err(CommandError::OutOfBound)
                }
            }
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_ltrim(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("ltrim", n != 3)?;
        let start = parse_i64(&argv[2]);
        let end = parse_i64(&argv[3]);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(CommandError::Custom("invalid range".to_owned()));
        };
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::ok(),
            Some(Value::List(list)) => {
                let before = list.len();
                let (start, end) = resolve_range(before, start, end);
                let kept: VecDeque<Vec<u8>> =
                    list.iter().skip(start).take(end - start).cloned().collect();
                *list = kept;
                before - list.len()
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        self.signal_list(db_idx, &argv[1], removed as u64, now_ms);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::ok()
    }

    fn cmd_rpoplpush(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("rpoplpush", n != 2)?;
        let db_idx = self.db_index(client)?;
        match self.dbs[db_idx].peek(&argv[1]) {
            None => Reply::null(),
            Some(Value::List(_)) => {
                match self.pop_now(
                    db_idx,
                    BlockKind::TailPopPush,
                    &argv[1],
                    Some(&argv[2]),
                    now_ms,
                )? {
                    Some(frame) => Reply::frame(frame),
                    None => Reply::null(),
                }
            }
            Some(_) => Err(CommandError::WrongType),
        }
    }

    // ---------------------------------------------------------------
    // Sets

    fn set_entry<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<&'a mut HashSet<Vec<u8>>, CommandError> {
        match db.get_or_insert_with(key, || Value::Set(HashSet::new())) {
            Value::Set(set) => Ok(set),
            _ => Err(CommandError::WrongType),
        }
    }

    fn read_set<'a>(
        db: &'a mut Db,
        key: &[u8],
    ) -> Result<Option<&'a HashSet<Vec<u8>>>, CommandError> {
        match db.get(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_sadd(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("sadd", n < 2)?;
        let db_idx = self.db_index(client)?;
        let added = {
            let set = Self::set_entry(&mut self.dbs[db_idx], &argv[1])?;
            argv[2..].iter().filter(|member| set.insert((*member).clone())).count()
        };
        self.signal(Some(&argv[1]), added as u64);
        Reply::int(added as i64)
    }

    fn cmd_scard(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("scard", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_set(db, &argv[1])? {
            None => Reply::int(0),
            Some(set) => Reply::int(set.len() as i64),
        }
    }

    fn cmd_setoper(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        oper: SetOper,
        store: bool,
    ) -> Result<Reply, CommandError> {
        if store {
            check_input("sdiffstore", n < 2)?;
        } else {
            check_input("sdiff", n < 1)?;
        }
        let db_idx = self.db_index(client)?;
        let keys = if store { &argv[2..] } else { &argv[1..] };
        let mut result: Option<HashSet<Vec<u8>>> = None;
        for key in keys {
            let operand = match self.dbs[db_idx].get(key) {
                None => HashSet::new(),
                Some(Value::Set(set)) => set.clone(),
                Some(_) => return Err(CommandError::WrongType),
            };
            result = Some(match result {
                None => operand,
                Some(acc) => match oper {
                    SetOper::Diff => acc.difference(&operand).cloned().collect(),
                    SetOper::Inter => acc.intersection(&operand).cloned().collect(),
                    SetOper::Union => acc.union(&operand).cloned().collect(),
                },
            });
        }
        let result = result.unwrap_or_default();
        if store {
            let dest = &argv[1];
            self.remove_key(db_idx, dest);
            if result.is_empty() {
                return Reply::int(0);
            }
            let len = result.len();
            self.dbs[db_idx].insert_data(dest.clone(), Value::Set(result));
            Reply::int(len as i64)
        } else {
            let members = result
                .into_iter()
                .map(RespFrame::bulk)
                .collect();
            Reply::frame(RespFrame::array(members))
        }
    }

    fn cmd_sismember(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("sismember", n != 2)?;
        let db = self.client_db(client)?;
        match Self::read_set(db, &argv[1])? {
            None => Reply::int(0),
            Some(set) => Reply::int(i64::from(set.contains(&argv[2]))),
        }
    }

    fn cmd_smembers(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("smembers", n != 1)?;
        let db = self.client_db(client)?;
        let members = match Self::read_set(db, &argv[1])? {
            None => Vec::new(),
            Some(set) => set.iter().map(|member| RespFrame::bulk(member.clone())).collect(),
        };
        Reply::frame(RespFrame::array(members))
    }

    fn cmd_smove(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("smove", n != 3)?;
        let db_idx = self.db_index(client)?;
        let member = &argv[3];
        match self.dbs[db_idx].peek(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::Set(set)) => {
                if !set.contains(member) {
                    return Reply::int(0);
                }
            }
            Some(_) => return Err(CommandError::WrongType),
        }
        match self.dbs[db_idx].peek(&argv[2]) {
            None | Some(Value::Set(_)) => {}
            Some(_) => return Err(CommandError::WrongType),
        }
        if let Some(Value::Set(source)) = self.dbs[db_idx].get_mut(&argv[1]) {
            source.remove(member);
        }
        {
            let dest = Self::set_entry(&mut self.dbs[db_idx], &argv[2])?;
            dest.insert(member.clone());
        }
        self.signal(Some(&argv[1]), 0);
        self.signal(Some(&argv[2]), 1);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(1)
    }

    fn cmd_spop(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("spop", n != 1)?;
        let db_idx = self.db_index(client)?;
        let members: Vec<Vec<u8>> = match self.dbs[db_idx].get(&argv[1]) {
            None => return Reply::null(),
            Some(Value::Set(set)) => set.iter().cloned().collect(),
            Some(_) => return Err(CommandError::WrongType),
        };
        if members.is_empty() {
            return Reply::null();
        }
        let pick = self.rand_index(members.len());
        let picked = members[pick].clone();
        if let Some(Value::Set(set)) = self.dbs[db_idx].get_mut(&argv[1]) {
            set.remove(&picked);
        }
        self.signal(Some(&argv[1]), 1);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::bulk(picked)
    }

    fn cmd_srandmember(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("srandmember", !(1..=2).contains(&n))?;
        let db_idx = self.db_index(client)?;
        let members: Vec<Vec<u8>> = match self.dbs[db_idx].get(&argv[1]) {
            None => Vec::new(),
            Some(Value::Set(set)) => set.iter().cloned().collect(),
            Some(_) => return Err(CommandError::WrongType),
        };
        if n == 1 {
            if members.is_empty() {
                return Reply::null();
            }
            let pick = self.rand_index(members.len());
            return Reply::bulk(members[pick].clone());
        }
        let count = parse_i64(&argv[2])
            .ok_or_else(|| CommandError::Custom("Invalid count".to_owned()))?;
        let mut result = Vec::new();
        if count < 0 {
            // With repetition.
            for _ in 0..count.unsigned_abs() {
                if members.is_empty() {
                    result.push(RespFrame::null());
                } else {
                    let pick = self.rand_index(members.len());
                    result.push(RespFrame::bulk(members[pick].clone()));
                }
            }
        } else if count > 0 {
            if members.is_empty() {
                result.push(RespFrame::null());
            } else if members.len() <= count as usize {
                result.extend(members.iter().map(|member| RespFrame::bulk(member.clone())));
                result.extend(
                    (0..count as usize - members.len()).map(|_| RespFrame::null()),
                );
            } else {
                let mut pool = members;
                for _ in 0..count {
                    let pick = self.rand_index(pool.len());
                    result.push(RespFrame::bulk(pool.swap_remove(pick)));
                }
            }
        }
        Reply::frame(RespFrame::array(result))
    }

    fn cmd_srem(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("srem", n < 2)?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::Set(set)) => {
                argv[2..].iter().filter(|member| set.remove(*member)).count()
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        self.signal(Some(&argv[1]), removed as u64);
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    // ---------------------------------------------------------------
    // Sorted sets

    fn zset_entry<'a>(db: &'a mut Db, key: &[u8]) -> Result<&'a mut Zset, CommandError> {
        match db.get_or_insert_with(key, || Value::ZSet(Zset::new())) {
            Value::ZSet(zset) => Ok(zset),
            _ => Err(CommandError::WrongType),
        }
    }

    fn read_zset<'a>(db: &'a mut Db, key: &[u8]) -> Result<Option<&'a Zset>, CommandError> {
        match db.get(key) {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(Some(zset)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn cmd_zadd(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zadd", n < 3 || (n - 1) % 2 != 0)?;
        let mut pairs = Vec::with_capacity((n - 1) / 2);
        for pair in argv[2..].chunks(2) {
            let score = parse_f64(&pair[0]).ok_or(CommandError::InvalidScore)?;
            pairs.push((score, pair[1].clone()));
        }
        let db_idx = self.db_index(client)?;
        let added = {
            let zset = Self::zset_entry(&mut self.dbs[db_idx], &argv[1])?;
            pairs
                .into_iter()
                .filter(|(score, member)| zset.add(*score, member.clone()))
                .count()
        };
        self.signal(Some(&argv[1]), added as u64);
        Reply::int(added as i64)
    }

    fn cmd_zcard(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zcard", n != 1)?;
        let db = self.client_db(client)?;
        match Self::read_zset(db, &argv[1])? {
            None => Reply::int(0),
            Some(zset) => Reply::int(zset.len() as i64),
        }
    }

    fn cmd_zcount(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zcount", n != 3)?;
        let min = parse_score_bound(&argv[2]).ok_or(CommandError::InvalidScore)?;
        let max = parse_score_bound(&argv[3]).ok_or(CommandError::InvalidScore)?;
        let db = self.client_db(client)?;
        match Self::read_zset(db, &argv[1])? {
            None => Reply::int(0),
            Some(zset) => Reply::int(zset.count(min, max) as i64),
        }
    }

    fn cmd_zincrby(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zincrby", n != 3)?;
        let increment = parse_f64(&argv[2]).ok_or(CommandError::InvalidScore)?;
        let db_idx = self.db_index(client)?;
        let score = {
            let zset = Self::zset_entry(&mut self.dbs[db_idx], &argv[1])?;
            let score = zset.score(&argv[3]).unwrap_or(0.0) + increment;
            zset.add(score, argv[3].clone());
            score
        };
        self.signal(Some(&argv[1]), 1);
        Reply::bulk(fmt_f64(score))
    }

    fn cmd_zrange(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zrange", !(3..=4).contains(&n))?;
        let start = parse_i64(&argv[2]).ok_or(CommandError::Syntax)?;
        let end = parse_i64(&argv[3]).ok_or(CommandError::Syntax)?;
        let withscores = if n == 4 {
            if !argv[4].eq_ignore_ascii_case(b"withscores") {
                return Err(CommandError::Syntax);
            }
            true
        } else {
            false
        };
        let db = self.client_db(client)?;
        let Some(zset) = Self::read_zset(db, &argv[1])? else {
            return Reply::frame(RespFrame::array(Vec::new()));
        };
        let (start, end) = resolve_range(zset.len(), start, end);
        let mut items = Vec::new();
        for (score, member) in zset.range(start, end) {
            items.push(RespFrame::bulk(member.to_vec()));
            if withscores {
                items.push(RespFrame::bulk(fmt_f64(score)));
            }
        }
        Reply::frame(RespFrame::array(items))
    }

    fn cmd_zrangebyscore(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zrangebyscore", !(3..=7).contains(&n))?;
        let min = parse_score_bound(&argv[2]).ok_or(CommandError::Syntax)?;
        let max = parse_score_bound(&argv[3]).ok_or(CommandError::Syntax)?;
        let mut withscores = false;
        let mut offset = 0_usize;
        let mut count: Option<usize> = None;
        let mut rest = &argv[4..];
        while !rest.is_empty() {
            if rest[0].eq_ignore_ascii_case(b"withscores") {
                withscores = true;
                rest = &rest[1..];
            } else if rest[0].eq_ignore_ascii_case(b"limit") && rest.len() >= 3 {
                offset = parse_i64(&rest[1])
                    .and_then(|raw| usize::try_from(raw).ok())
                    .ok_or(CommandError::Syntax)?;
                count = Some(
                    parse_i64(&rest[2])
                        .and_then(|raw| usize::try_from(raw).ok())
                        .ok_or(CommandError::Syntax)?,
                );
                rest = &rest[3..];
            } else {
                return Err(CommandError::Syntax);
            }
        }
        let db = self.client_db(client)?;
        let Some(zset) = Self::read_zset(db, &argv[1])? else {
            return Reply::frame(RespFrame::array(Vec::new()));
        };
        let mut items = Vec::new();
        for (score, member) in zset.range_by_score(min, max, offset, count) {
            items.push(RespFrame::bulk(member.to_vec()));
            if withscores {
                items.push(RespFrame::bulk(fmt_f64(score)));
            }
        }
        Reply::frame(RespFrame::array(items))
    }

    fn cmd_zrank(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zrank", n != 2)?;
        let db = self.client_db(client)?;
        match Self::read_zset(db, &argv[1])? {
            None => Reply::null(),
            Some(zset) => match zset.rank(&argv[2]) {
                Some(rank) => Reply::int(rank as i64),
                None => Reply::null(),
            },
        }
    }

    fn cmd_zrem(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zrem", n < 2)?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::ZSet(zset)) => {
                let members: Vec<&[u8]> = argv[2..].iter().map(Vec::as_slice).collect();
                zset.remove_items(&members)
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal(Some(&argv[1]), removed as u64);
        }
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    fn cmd_zremrangebyrank(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zremrangebyrank", n != 3)?;
        let start = parse_i64(&argv[2]).ok_or(CommandError::Syntax)?;
        let end = parse_i64(&argv[3]).ok_or(CommandError::Syntax)?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::ZSet(zset)) => {
                let (start, end) = resolve_range(zset.len(), start, end);
                zset.remove_range(start, end)
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal(Some(&argv[1]), removed as u64);
        }
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    fn cmd_zremrangebyscore(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zremrangebyscore", n != 3)?;
        let min = parse_score_bound(&argv[2]).ok_or(CommandError::Syntax)?;
        let max = parse_score_bound(&argv[3]).ok_or(CommandError::Syntax)?;
        let db_idx = self.db_index(client)?;
        let removed = match self.dbs[db_idx].get_mut(&argv[1]) {
            None => return Reply::int(0),
            Some(Value::ZSet(zset)) => zset.remove_range_by_score(min, max),
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal(Some(&argv[1]), removed as u64);
        }
        self.drop_if_spent(db_idx, &argv[1]);
        Reply::int(removed as i64)
    }

    fn cmd_zscore(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("zscore", n != 2)?;
        let db = self.client_db(client)?;
        match Self::read_zset(db, &argv[1])? {
            None => Reply::null(),
            Some(zset) => match zset.score(&argv[2]) {
                Some(score) => Reply::bulk(fmt_f64(score)),
                None => Reply::null(),
            },
        }
    }

    /// ZUNIONSTORE / ZINTERSTORE: `dest numkeys key [key ...]
    /// [WEIGHTS w ...] [AGGREGATE SUM|MIN|MAX]`.
    fn cmd_zsetoper(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        union: bool,
    ) -> Result<Reply, CommandError> {
        check_input("zunionstore", n < 3)?;
        let numkeys = parse_i64(&argv[2]).unwrap_or(0);
        if numkeys <= 0 {
            return Err(CommandError::Custom(
                "at least 1 input key is needed for ZUNIONSTORE/ZINTERSTORE".to_owned(),
            ));
        }
        let numkeys = numkeys as usize;
        if argv.len() < 3 + numkeys {
            return Err(CommandError::Custom(
                "numkeys does not match number of sets".to_owned(),
            ));
        }
        let db_idx = self.db_index(client)?;
        let mut sets: Vec<Zset> = Vec::with_capacity(numkeys);
        for key in &argv[3..3 + numkeys] {
            match self.dbs[db_idx].get(key) {
                None => sets.push(Zset::new()),
                Some(Value::ZSet(zset)) => {
                    let mut copy = Zset::new();
                    for (score, member) in zset.iter() {
                        copy.add(score, member.to_vec());
                    }
                    sets.push(copy);
                }
                Some(_) => return Err(CommandError::WrongType),
            }
        }
        let mut weights: Option<Vec<f64>> = None;
        let mut aggregate = Aggregate::Sum;
        let mut rest = &argv[3 + numkeys..];
        while !rest.is_empty() {
            if rest[0].eq_ignore_ascii_case(b"weights") {
                if rest.len() < 1 + numkeys {
                    return Err(CommandError::Syntax);
                }
                let mut parsed = Vec::with_capacity(numkeys);
                for raw in &rest[1..1 + numkeys] {
                    parsed.push(parse_f64(raw).ok_or(CommandError::Syntax)?);
                }
                weights = Some(parsed);
                rest = &rest[1 + numkeys..];
            } else if rest[0].eq_ignore_ascii_case(b"aggregate") && rest.len() >= 2 {
                aggregate = match rest[1].to_ascii_lowercase().as_slice() {
                    b"sum" => Aggregate::Sum,
                    b"min" => Aggregate::Min,
                    b"max" => Aggregate::Max,
                    _ => return Err(CommandError::Syntax),
                };
                rest = &rest[2..];
            } else {
                return Err(CommandError::Syntax);
            }
        }
        let weights = weights.unwrap_or_else(|| vec![1.0; numkeys]);
        let refs: Vec<&Zset> = sets.iter().collect();
        let result = if union {
            Zset::union(&refs, &weights, aggregate)
        } else {
            Zset::inter(&refs, &weights, aggregate)
        };
        let dest = &argv[1];
        if self.remove_key(db_idx, dest).is_some() {
            self.signal(Some(dest), 1);
        }
        let len = result.len();
        self.dbs[db_idx].insert_data(dest.clone(), Value::ZSet(result));
        self.signal(Some(dest), len as u64);
        Reply::int(len as i64)
    }

    // ---------------------------------------------------------------
    // Pub/sub

    fn cmd_subscribe(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("subscribe", n == 0)?;
        let mut replies = Vec::with_capacity(n);
        for channel in &argv[1..] {
            let subscribers = self.channels.entry(channel.clone()).or_default();
            subscribers.insert(client);
            let count = subscribers.len();
            self.state_mut(client)?.channels.insert(channel.clone());
            replies.push(RespFrame::array(vec![
                RespFrame::bulk(*b"subscribe"),
                RespFrame::bulk(channel.clone()),
                RespFrame::Integer(count as i64),
            ]));
        }
        Ok(Reply::Multi(replies))
    }

    fn cmd_unsubscribe(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        let targets: Vec<Vec<u8>> = if n > 0 {
            argv[1..].to_vec()
        } else {
            self.channels.keys().cloned().collect()
        };
        let mut replies = Vec::new();
        for channel in targets {
            let Some(subscribers) = self.channels.get_mut(&channel) else {
                continue;
            };
            if subscribers.remove(&client) {
                if subscribers.is_empty() {
                    self.channels.remove(&channel);
                }
                self.state_mut(client)?.channels.remove(&channel);
                replies.push(RespFrame::array(vec![
                    RespFrame::bulk(*b"unsubscribe"),
                    RespFrame::bulk(channel),
                ]));
            }
        }
        Ok(Reply::Multi(replies))
    }

    fn cmd_psubscribe(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("psubscribe", n == 0)?;
        let mut replies = Vec::with_capacity(n);
        for pattern in &argv[1..] {
            self.patterns.entry(pattern.clone()).or_default().insert(client);
            let state = self.state_mut(client)?;
            state.patterns.insert(pattern.clone());
            let count = state.patterns.len();
            replies.push(RespFrame::array(vec![
                RespFrame::bulk(*b"psubscribe"),
                RespFrame::bulk(pattern.clone()),
                RespFrame::Integer(count as i64),
            ]));
        }
        Ok(Reply::Multi(replies))
    }

    fn cmd_punsubscribe(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        let targets: Vec<Vec<u8>> = if n > 0 {
            argv[1..].to_vec()
        } else {
            self.patterns.keys().cloned().collect()
        };
        let mut replies = Vec::new();
        for pattern in targets {
            let Some(subscribers) = self.patterns.get_mut(&pattern) else {
                continue;
            };
            if subscribers.remove(&client) {
                if subscribers.is_empty() {
                    self.patterns.remove(&pattern);
                }
                self.state_mut(client)?.patterns.remove(&pattern);
                replies.push(RespFrame::array(vec![
                    RespFrame::bulk(*b"punsubscribe"),
                    RespFrame::bulk(pattern),
                ]));
            }
        }
        Ok(Reply::Multi(replies))
    }

    fn cmd_publish(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("publish", n != 2)?;
        let _ = client;
        let (channel, payload) = (&argv[1], &argv[2]);
        let mut delivered = 0_i64;
        if let Some(subscribers) = self.channels.get(channel) {
            let message = RespFrame::array(vec![
                RespFrame::bulk(*b"message"),
                RespFrame::bulk(channel.clone()),
                RespFrame::bulk(payload.clone()),
            ]);
            for subscriber in subscribers {
                self.outbox.push((*subscriber, message.clone()));
                delivered += 1;
            }
        }
        for (pattern, subscribers) in &self.patterns {
            if !glob_match(pattern, channel) {
                continue;
            }
            let message = RespFrame::array(vec![
                RespFrame::bulk(*b"pmessage"),
                RespFrame::bulk(pattern.clone()),
                RespFrame::bulk(channel.clone()),
                RespFrame::bulk(payload.clone()),
            ]);
            for subscriber in subscribers {
                self.outbox.push((*subscriber, message.clone()));
                delivered += 1;
            }
        }
        Reply::int(delivered)
    }

    fn cmd_pubsub(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("pubsub", n == 0)?;
        let _ = client;
        let sub = argv[1].to_ascii_lowercase();
        match sub.as_slice() {
            b"channels" => {
                check_input("pubsub", n > 2)?;
                let channels: Vec<RespFrame> = self
                    .channels
                    .keys()
                    .filter(|channel| n != 2 || glob_match(&argv[2], channel))
                    .map(|channel| RespFrame::bulk(channel.clone()))
                    .collect();
                Reply::frame(RespFrame::array(channels))
            }
            b"numsub" => {
                let mut pairs = Vec::new();
                for channel in &argv[2..] {
                    let count = self.channels.get(channel).map_or(0, HashSet::len);
                    pairs.push(RespFrame::bulk(channel.clone()));
                    pairs.push(RespFrame::Integer(count as i64));
                }
                Reply::frame(RespFrame::array(pairs))
            }
            b"numpat" => {
                check_input("pubsub", n > 1)?;
                let count: usize = self.patterns.values().map(HashSet::len).sum();
                Reply::int(count as i64)
            }
            other => Err(CommandError::Custom(format!(
                "Unknown command 'pubsub {}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    // ---------------------------------------------------------------
    // Transactions

    fn cmd_multi(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("multi", n != 0)?;
        let _ = argv;
        let state = self.state_mut(client)?;
        if state.transaction.is_some() {
            return Err(CommandError::Custom(
                "MULTI calls can not be nested".to_owned(),
            ));
        }
        state.transaction = Some(Vec::new());
        Reply::ok()
    }

    fn cmd_exec(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("exec", n != 0)?;
        let _ = argv;
        let state = self.state_mut(client)?;
        let Some(queued) = state.transaction.take() else {
            return Err(CommandError::Custom("EXEC without MULTI".to_owned()));
        };
        let aborted = state.dirty_cas;
        self.close_transaction(client);
        if aborted {
            return Reply::frame(RespFrame::array(Vec::new()));
        }
        let mut replies = Vec::with_capacity(queued.len());
        for queued_argv in queued {
            let name = String::from_utf8_lossy(&queued_argv[0]).to_lowercase();
            match self.run_command(client, &name, &queued_argv, now_ms, true) {
                Ok(Reply::Frame(frame)) => replies.push(frame),
                Ok(Reply::Multi(frames)) => replies.extend(frames),
                Ok(Reply::Blocked) => replies.push(RespFrame::null_array()),
                Err(err) => replies.push(err.to_frame()),
            }
        }
        Reply::frame(RespFrame::array(replies))
    }

    fn cmd_discard(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("discard", n != 0)?;
        let _ = argv;
        if self.state(client)?.transaction.is_none() {
            return Err(CommandError::Custom("DISCARD without MULTI".to_owned()));
        }
        self.close_transaction(client);
        Reply::ok()
    }

    fn cmd_watch(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("watch", n == 0)?;
        let state = self.state_mut(client)?;
        if state.transaction.is_some() {
            return Err(CommandError::Custom(
                "WATCH inside MULTI is not allowed".to_owned(),
            ));
        }
        let watched = state.watched_keys.get_or_insert_with(HashSet::new);
        for key in &argv[1..] {
            watched.insert(key.clone());
        }
        self.watching.insert(client);
        Reply::ok()
    }

    /// UNWATCH clears the watch set and the dirty flag but keeps any
    /// queued transaction.
    fn cmd_unwatch(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("unwatch", n != 0)?;
        let _ = argv;
        let state = self.state_mut(client)?;
        let queued = state.transaction.take();
        self.close_transaction(client);
        self.state_mut(client)?.transaction = queued;
        Reply::ok()
    }

    fn close_transaction(&mut self, client: ClientId) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.transaction = None;
            state.watched_keys = None;
            state.dirty_cas = false;
        }
        self.watching.remove(&client);
    }

    // ---------------------------------------------------------------
    // Connection

    fn cmd_auth(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("auth", n != 1)?;
        let configured = self.config.password.clone().unwrap_or_default();
        let state = self.state_mut(client)?;
        state.given_password = argv[1].clone();
        if state.given_password == configured {
            Reply::ok()
        } else {
            Err(CommandError::Custom("wrong password".to_owned()))
        }
    }

    fn cmd_echo(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("echo", n != 1)?;
        let _ = client;
        Reply::bulk(argv[1].clone())
    }

    fn cmd_ping(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("ping", n != 0)?;
        let _ = (client, argv);
        Reply::frame(RespFrame::SimpleString("PONG".to_owned()))
    }

    fn cmd_quit(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("quit", n != 0)?;
        let _ = (client, argv);
        self.close_after_reply = true;
        Reply::ok()
    }

    fn cmd_select(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("select", n != 1)?;
        let highest = self.dbs.len() - 1;
        let index = parse_i64(&argv[1])
            .and_then(|raw| usize::try_from(raw).ok())
            .filter(|index| *index <= highest);
        match index {
            Some(index) => {
                self.state_mut(client)?.db_index = index;
                Reply::ok()
            }
            None => Err(CommandError::Custom(format!(
                "select requires a database number between 0 and {highest}"
            ))),
        }
    }

    // ---------------------------------------------------------------
    // Server

    fn cmd_save(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("save", n != 0)?;
        let _ = (client, argv);
        self.save_snapshot(now_ms);
        Reply::ok()
    }

    fn cmd_client(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("client", n == 0)?;
        let sub = argv[1].to_ascii_lowercase();
        match sub.as_slice() {
            b"list" => {
                check_input("client", n != 1)?;
                let _ = client;
                let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
                ids.sort_unstable();
                let mut lines = Vec::with_capacity(ids.len());
                for id in ids {
                    let state = &self.clients[&id];
                    lines.push(format!(
                        "addr={} fd={} age={} db={} sub={} psub={} cmd={}",
                        state.addr,
                        id,
                        now_ms.saturating_sub(state.connected_at_ms) / 1_000,
                        state.db_index,
                        state.channels.len(),
                        state.patterns.len(),
                        state.last_command,
                    ));
                }
                Reply::bulk(lines.join("\n").into_bytes())
            }
            other => Err(CommandError::Custom(format!(
                "unknown command 'client {}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn cmd_config(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("config", n == 0)?;
        let _ = client;
        let sub = argv[1].to_ascii_lowercase();
        match sub.as_slice() {
            b"get" => {
                if n != 2 {
                    return Err(CommandError::Custom("'config get' no argument".to_owned()));
                }
                Reply::bulk(Vec::new())
            }
            b"set" => {
                if n != 3 {
                    return Err(CommandError::Custom("'config set' no argument".to_owned()));
                }
                Reply::ok()
            }
            b"rewrite" => Reply::ok(),
            b"resetstat" => {
                for db in &mut self.dbs {
                    db.reset_stats();
                }
                Reply::ok()
            }
            other => Err(CommandError::Custom(format!(
                "'config {}' not valid",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn cmd_dbsize(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("dbsize", n != 0)?;
        let _ = argv;
        let len = self.client_db(client)?.len();
        Reply::int(len as i64)
    }

    fn cmd_flushdb(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("flushdb", n != 0)?;
        let _ = argv;
        let db_idx = self.db_index(client)?;
        self.flush_one(db_idx);
        Reply::ok()
    }

    fn cmd_flushall(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("flushall", n != 0)?;
        let _ = (client, argv);
        for index in 0..self.dbs.len() {
            self.flush_one(index);
        }
        Reply::ok()
    }

    fn flush_one(&mut self, db_idx: usize) {
        let (removed, timers) = self.dbs[db_idx].flush();
        for timer in timers {
            self.timers.cancel(timer);
        }
        self.signal(None, removed as u64);
    }

    fn cmd_info(
        &mut self,
        client: ClientId,
        argv: &[Vec<u8>],
        n: usize,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        check_input("info", n != 0)?;
        let _ = (client, argv);
        let mut text = String::new();
        for (section, entries) in self.info_sections(now_ms) {
            text.push('#');
            text.push_str(section);
            text.push('\n');
            for (key, value) in entries {
                text.push_str(&key);
                text.push(':');
                text.push_str(&value);
                text.push('\n');
            }
        }
        Reply::bulk(text.into_bytes())
    }

    /// Structured stats snapshot, consumed by INFO and exposed to the
    /// server shell.
    #[must_use]
    pub fn info_sections(&self, now_ms: u64) -> Vec<(&'static str, Vec<(String, String)>)> {
        let mut sections = Vec::new();
        sections.push((
            "server",
            vec![
                ("redis_version".to_owned(), SERVER_VERSION.to_owned()),
                ("uptime_in_seconds".to_owned(), (now_ms / 1_000).to_string()),
            ],
        ));
        sections.push((
            "clients",
            vec![
                ("connected_clients".to_owned(), self.clients.len().to_string()),
                ("blocked_clients".to_owned(), self.blocked_clients.to_string()),
            ],
        ));
        let mut keyspace = Vec::new();
        for db in &self.dbs {
            if !db.is_empty() {
                keyspace.push((
                    format!("db{}", db.index()),
                    format!("keys={},expires={}", db.len(), db.expiring_len()),
                ));
            }
        }
        sections.push(("keyspace", keyspace));
        let hits: u64 = self.dbs.iter().map(Db::hits).sum();
        let misses: u64 = self.dbs.iter().map(Db::misses).sum();
        let expired: u64 = self.dbs.iter().map(Db::expired).sum();
        sections.push((
            "stats",
            vec![
                ("keyspace_hits".to_owned(), hits.to_string()),
                ("keyspace_misses".to_owned(), misses.to_string()),
                ("expired_keys".to_owned(), expired.to_string()),
                ("keys_changed".to_owned(), self.dirty.to_string()),
                ("pubsub_channels".to_owned(), self.channels.len().to_string()),
                ("pubsub_patterns".to_owned(), self.patterns.len().to_string()),
                ("blocked_clients".to_owned(), self.blocked_clients.to_string()),
            ],
        ));
        sections.push((
            "persistence",
            vec![
                ("rdb_changes_since_last_save".to_owned(), self.dirty.to_string()),
                ("rdb_last_save_time".to_owned(), (self.last_save_ms / 1_000).to_string()),
            ],
        ));
        sections
    }

    fn cmd_monitor(&mut self, client: ClientId, argv: &[Vec<u8>], n: usize) -> Result<Reply, CommandError> {
        check_input("monitor", n != 0)?;
        let _ = argv;
        self.monitors.insert(client);
        Reply::ok()
    }

    fn cmd_time(&mut self, argv: &[Vec<u8>], n: usize, now_ms: u64) -> Result<Reply, CommandError> {
        check_input("time", n != 0)?;
        let _ = argv;
        let seconds = now_ms / 1_000;
        let micros = (now_ms % 1_000) * 1_000;
        Reply::frame(RespFrame::array(vec![
            RespFrame::bulk(seconds.to_string().into_bytes()),
            RespFrame::bulk(micros.to_string().into_bytes()),
        ]))
    }
}

enum Gate {
    Run,
    Reply(RespFrame),
}

#[derive(Clone, Copy)]
enum IncrSpec {
    Fixed(i64),
    Arg,
    NegArg,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SetOper {
    Diff,
    Inter,
    Union,
}

fn is_subscribe_command(name: &str) -> bool {
    matches!(
        name,
        "psubscribe" | "punsubscribe" | "subscribe" | "unsubscribe" | "quit"
    )
}

fn check_input(command: &str, failed: bool) -> Result<(), CommandError> {
    if failed {
        Err(CommandError::wrong_arity(command))
    } else {
        Ok(())
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let parsed: f64 = std::str::from_utf8(bytes).ok()?.trim().parse().ok()?;
    if parsed.is_nan() { None } else { Some(parsed) }
}

/// Integer-valued floats render without the trailing `.0`, the way
/// scores and INCRBYFLOAT results go out on the wire.
fn fmt_f64(value: f64) -> Vec<u8> {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e17 {
        format!("{}", value as i64).into_bytes()
    } else {
        format!("{value}").into_bytes()
    }
}

fn parse_bit_offset(bytes: &[u8]) -> Result<usize, CommandError> {
    parse_i64(bytes)
        .and_then(|raw| usize::try_from(raw).ok())
        .filter(|offset| (*offset as u64) < u64::from(u32::MAX))
        .ok_or_else(|| {
            CommandError::Custom("bit offset is not an integer or out of range".to_owned())
        })
}

/// Python-slice style range resolution: negative indices count from the
/// end, the end index is inclusive on the wire and exclusive here.
fn resolve_range(len: usize, start: i64, end: i64) -> (usize, usize) {
    let len = len as i64;
    let start = if start < 0 { len + start } else { start }.clamp(0, len);
    let end = (if end < 0 { len + end + 1 } else { end + 1 }).clamp(0, len);
    if start >= end {
        (0, 0)
    } else {
        (start as usize, end as usize)
    }
}

/// LREM semantics: `count > 0` removes from the head, `count < 0` from
/// the tail, `count == 0` removes every occurrence.
fn remove_from_list(list: &mut VecDeque<Vec<u8>>, needle: &[u8], count: i64) -> usize {
    let limit = if count == 0 {
        usize::MAX
    } else {
        count.unsigned_abs() as usize
    };
    let mut removed = 0;
    if count < 0 {
        let mut index = list.len();
        while index > 0 && removed < limit {
            index -= 1;
            if list[index] == needle {
                list.remove(index);
                removed += 1;
            }
        }
    } else {
        let mut index = 0;
        while index < list.len() && removed < limit {
            if list[index] == needle {
                list.remove(index);
                removed += 1;
            } else {
                index += 1;
            }
        }
    }
    removed
}

fn parse_score_bound(bytes: &[u8]) -> Option<ScoreBound> {
    if let Some(rest) = bytes.strip_prefix(b"(") {
        Some(ScoreBound::exclusive(parse_f64(rest)?))
    } else {
        Some(ScoreBound::inclusive(parse_f64(bytes)?))
    }
}
