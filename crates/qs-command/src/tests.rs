use qs_config::Config;
use qs_protocol::RespFrame;
use qs_store::ClientId;

use super::{CommandError, Engine, frame_to_argv};

fn engine() -> Engine {
    Engine::new(Config::default(), 0)
}

fn client(engine: &mut Engine) -> ClientId {
    engine.connect("127.0.0.1:40000", 0)
}

fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|part| part.as_bytes().to_vec()).collect()
}

fn run(
    engine: &mut Engine,
    id: ClientId,
    parts: &[&str],
    now_ms: u64,
) -> Vec<(ClientId, RespFrame)> {
    engine.dispatch(id, argv(parts), now_ms).writes
}

/// Dispatch and expect exactly one reply to the issuing client.
fn reply(engine: &mut Engine, id: ClientId, parts: &[&str], now_ms: u64) -> RespFrame {
    let writes = run(engine, id, parts, now_ms);
    assert_eq!(writes.len(), 1, "expected one write, got {writes:?}");
    assert_eq!(writes[0].0, id);
    writes[0].1.clone()
}

fn ok() -> RespFrame {
    RespFrame::ok()
}

fn bulk(text: &str) -> RespFrame {
    RespFrame::bulk(text.as_bytes().to_vec())
}

#[test]
fn ping_and_echo() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["PING"], 0),
        RespFrame::SimpleString("PONG".to_owned())
    );
    assert_eq!(reply(&mut engine, id, &["ECHO", "hello"], 0), bulk("hello"));
}

#[test]
fn unknown_and_unsupported_commands() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["FROBNICATE"], 0),
        RespFrame::Error("ERR unknown command 'frobnicate'".to_owned())
    );
    assert_eq!(
        reply(&mut engine, id, &["EVAL", "return 1", "0"], 0),
        RespFrame::Error("ERR Command not yet supported".to_owned())
    );
}

#[test]
fn wrong_arity_names_the_command() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["GET"], 0),
        RespFrame::Error("ERR wrong number of arguments for 'get'".to_owned())
    );
    assert_eq!(
        reply(&mut engine, id, &["RENAMENX", "a"], 0),
        RespFrame::Error("ERR wrong number of arguments for 'renamenx'".to_owned())
    );
}

#[test]
fn set_get_expire_scenario() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(reply(&mut engine, id, &["SET", "foo", "bar", "EX", "10"], 0), ok());
    assert_eq!(reply(&mut engine, id, &["GET", "foo"], 100), bulk("bar"));
    let ttl = reply(&mut engine, id, &["TTL", "foo"], 100);
    match ttl {
        RespFrame::Integer(seconds) => assert!(seconds > 0 && seconds <= 10),
        other => panic!("unexpected TTL reply {other:?}"),
    }
    // Force the eviction timer.
    assert_eq!(engine.next_deadline(), Some(10_000));
    let writes = engine.on_tick(10_000);
    assert!(writes.is_empty());
    assert_eq!(reply(&mut engine, id, &["GET", "foo"], 10_001), RespFrame::null());
    assert_eq!(
        reply(&mut engine, id, &["EXISTS", "foo"], 10_001),
        RespFrame::Integer(0)
    );
}

#[test]
fn expire_then_persist_keeps_value() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "k", "payload"], 0);
    assert_eq!(reply(&mut engine, id, &["EXPIRE", "k", "5"], 0), RespFrame::Integer(1));
    assert_eq!(reply(&mut engine, id, &["PERSIST", "k"], 100), RespFrame::Integer(1));
    // The old timer must not evict.
    engine.on_tick(60_000);
    assert_eq!(reply(&mut engine, id, &["GET", "k"], 60_000), bulk("payload"));
    assert_eq!(reply(&mut engine, id, &["TTL", "k"], 60_000), RespFrame::Integer(-1));
}

#[test]
fn ttl_of_missing_key_is_minus_two() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(reply(&mut engine, id, &["TTL", "nope"], 0), RespFrame::Integer(-2));
    assert_eq!(reply(&mut engine, id, &["PTTL", "nope"], 0), RespFrame::Integer(-2));
}

#[test]
fn incr_decr_family() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(reply(&mut engine, id, &["INCR", "n"], 0), RespFrame::Integer(1));
    assert_eq!(reply(&mut engine, id, &["INCRBY", "n", "9"], 0), RespFrame::Integer(10));
    assert_eq!(reply(&mut engine, id, &["DECR", "n"], 0), RespFrame::Integer(9));
    assert_eq!(reply(&mut engine, id, &["DECRBY", "n", "4"], 0), RespFrame::Integer(5));
    assert_eq!(reply(&mut engine, id, &["GET", "n"], 0), bulk("5"));
    assert_eq!(
        reply(&mut engine, id, &["INCRBYFLOAT", "n", "0.5"], 0),
        bulk("5.5")
    );
}

#[test]
fn set_nx_xx_options() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(reply(&mut engine, id, &["SET", "k", "a", "NX"], 0), ok());
    assert_eq!(
        reply(&mut engine, id, &["SET", "k", "b", "NX"], 0),
        RespFrame::null()
    );
    assert_eq!(reply(&mut engine, id, &["SET", "k", "c", "XX"], 0), ok());
    assert_eq!(
        reply(&mut engine, id, &["SET", "missing", "v", "XX"], 0),
        RespFrame::null()
    );
    assert_eq!(reply(&mut engine, id, &["GET", "k"], 0), bulk("c"));
}

#[test]
fn append_strlen_getrange() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["APPEND", "s", "Hello "], 0),
        RespFrame::Integer(6)
    );
    assert_eq!(
        reply(&mut engine, id, &["APPEND", "s", "World"], 0),
        RespFrame::Integer(11)
    );
    assert_eq!(reply(&mut engine, id, &["STRLEN", "s"], 0), RespFrame::Integer(11));
    assert_eq!(
        reply(&mut engine, id, &["GETRANGE", "s", "0", "4"], 0),
        bulk("Hello")
    );
    assert_eq!(
        reply(&mut engine, id, &["GETRANGE", "s", "-5", "-1"], 0),
        bulk("World")
    );
}

#[test]
fn bit_operations() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["SETBIT", "b", "7", "1"], 0),
        RespFrame::Integer(0)
    );
    assert_eq!(
        reply(&mut engine, id, &["GETBIT", "b", "7"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(
        reply(&mut engine, id, &["GETBIT", "b", "6"], 0),
        RespFrame::Integer(0)
    );
    assert_eq!(reply(&mut engine, id, &["BITCOUNT", "b"], 0), RespFrame::Integer(1));
    reply(&mut engine, id, &["SET", "x", "abc"], 0);
    reply(&mut engine, id, &["SET", "y", "abd"], 0);
    assert_eq!(
        reply(&mut engine, id, &["BITOP", "XOR", "dest", "x", "y"], 0),
        RespFrame::Integer(3)
    );
}

#[test]
fn wrongtype_does_not_mutate() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SADD", "s", "member"], 0);
    let err = reply(&mut engine, id, &["LPUSH", "s", "x"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.starts_with("WRONGTYPE")));
    assert_eq!(
        reply(&mut engine, id, &["SMEMBERS", "s"], 0),
        RespFrame::array(vec![bulk("member")])
    );
    let err = reply(&mut engine, id, &["GET", "s"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.starts_with("WRONGTYPE")));
    let err = reply(&mut engine, id, &["ZADD", "s", "1", "m"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.starts_with("WRONGTYPE")));
}

#[test]
fn hash_commands() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["HSET", "h", "f", "v"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(
        reply(&mut engine, id, &["HSET", "h", "f", "w"], 0),
        RespFrame::Integer(0)
    );
    assert_eq!(reply(&mut engine, id, &["HGET", "h", "f"], 0), bulk("w"));
    assert_eq!(
        reply(&mut engine, id, &["HSETNX", "h", "f", "z"], 0),
        RespFrame::Integer(0)
    );
    assert_eq!(reply(&mut engine, id, &["HGET", "h", "f"], 0), bulk("w"));
    assert_eq!(
        reply(&mut engine, id, &["HINCRBY", "h", "count", "5"], 0),
        RespFrame::Integer(5)
    );
    assert_eq!(
        reply(&mut engine, id, &["HLEN", "h"], 0),
        RespFrame::Integer(2)
    );
    assert_eq!(
        reply(&mut engine, id, &["HDEL", "h", "f", "count"], 0),
        RespFrame::Integer(2)
    );
    // Hash emptied: key is culled.
    assert_eq!(reply(&mut engine, id, &["EXISTS", "h"], 0), RespFrame::Integer(0));
}

#[test]
fn list_push_pop_range() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["RPUSH", "l", "a", "b", "c"], 0),
        RespFrame::Integer(3)
    );
    assert_eq!(
        reply(&mut engine, id, &["LRANGE", "l", "0", "-1"], 0),
        RespFrame::array(vec![bulk("a"), bulk("b"), bulk("c")])
    );
    assert_eq!(reply(&mut engine, id, &["LPOP", "l"], 0), bulk("a"));
    assert_eq!(reply(&mut engine, id, &["RPOP", "l"], 0), bulk("c"));
    assert_eq!(reply(&mut engine, id, &["LLEN", "l"], 0), RespFrame::Integer(1));
    assert_eq!(reply(&mut engine, id, &["RPOP", "l"], 0), bulk("b"));
    assert_eq!(reply(&mut engine, id, &["EXISTS", "l"], 0), RespFrame::Integer(0));
    assert_eq!(reply(&mut engine, id, &["LPOP", "l"], 0), RespFrame::null());
}

#[test]
fn linsert_lrem_lset_ltrim() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["RPUSH", "l", "a", "b", "a", "c", "a"], 0);
    assert_eq!(
        reply(&mut engine, id, &["LINSERT", "l", "BEFORE", "b", "x"], 0),
        RespFrame::Integer(6)
    );
    assert_eq!(
        reply(&mut engine, id, &["LREM", "l", "2", "a"], 0),
        RespFrame::Integer(2)
    );
    assert_eq!(
        reply(&mut engine, id, &["LRANGE", "l", "0", "-1"], 0),
        RespFrame::array(vec![bulk("x"), bulk("b"), bulk("c"), bulk("a")])
    );
    assert_eq!(reply(&mut engine, id, &["LSET", "l", "1", "B"], 0), ok());
    let err = reply(&mut engine, id, &["LSET", "l", "9", "z"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.contains("Out of bound")));
    assert_eq!(reply(&mut engine, id, &["LTRIM", "l", "1", "2"], 0), ok());
    assert_eq!(
        reply(&mut engine, id, &["LRANGE", "l", "0", "-1"], 0),
        RespFrame::array(vec![bulk("B"), bulk("c")])
    );
}

#[test]
fn rpoplpush_moves_tail_to_head() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["RPUSH", "src", "a", "b"], 0);
    reply(&mut engine, id, &["RPUSH", "dst", "z"], 0);
    assert_eq!(reply(&mut engine, id, &["RPOPLPUSH", "src", "dst"], 0), bulk("b"));
    assert_eq!(
        reply(&mut engine, id, &["LRANGE", "dst", "0", "-1"], 0),
        RespFrame::array(vec![bulk("b"), bulk("z")])
    );
}

#[test]
fn blocking_pop_wakes_on_push() {
    let mut engine = engine();
    let consumer = client(&mut engine);
    let producer = client(&mut engine);
    // BLPOP blocks: no reply yet.
    let writes = run(&mut engine, consumer, &["BLPOP", "queue", "0"], 0);
    assert!(writes.is_empty());
    // Any further command from the blocked client is rejected.
    let gated = reply(&mut engine, consumer, &["PING"], 10);
    assert!(matches!(gated, RespFrame::Error(ref m) if m.contains("Blocked")));
    // The producer pushes: the blocked consumer gets (key, value).
    let writes = run(&mut engine, producer, &["RPUSH", "queue", "job"], 20);
    assert_eq!(writes.len(), 2);
    assert_eq!(
        writes[0],
        (consumer, RespFrame::array(vec![bulk("queue"), bulk("job")]))
    );
    assert_eq!(writes[1], (producer, RespFrame::Integer(1)));
    // The key emptied out.
    assert_eq!(
        reply(&mut engine, producer, &["EXISTS", "queue"], 30),
        RespFrame::Integer(0)
    );
}

#[test]
fn blocking_pop_fifo_across_two_waiters() {
    let mut engine = engine();
    let first = client(&mut engine);
    let second = client(&mut engine);
    let producer = client(&mut engine);
    assert!(run(&mut engine, first, &["BLPOP", "q", "0"], 0).is_empty());
    assert!(run(&mut engine, second, &["BLPOP", "q", "0"], 1).is_empty());
    let writes = run(&mut engine, producer, &["RPUSH", "q", "one", "two"], 2);
    // Both waiters served in registration order, then the push reply.
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0], (first, RespFrame::array(vec![bulk("q"), bulk("one")])));
    assert_eq!(writes[1], (second, RespFrame::array(vec![bulk("q"), bulk("two")])));
    assert_eq!(writes[2], (producer, RespFrame::Integer(2)));
}

#[test]
fn blocking_pop_timeout_replies_null_array() {
    let mut engine = engine();
    let consumer = client(&mut engine);
    assert!(run(&mut engine, consumer, &["BLPOP", "q", "5"], 0).is_empty());
    assert_eq!(engine.next_deadline(), Some(5_000));
    let writes = engine.on_tick(5_000);
    assert_eq!(writes, vec![(consumer, RespFrame::null_array())]);
    // Unblocked: commands flow again and the waiter registration is gone.
    assert_eq!(
        reply(&mut engine, consumer, &["PING"], 6_000),
        RespFrame::SimpleString("PONG".to_owned())
    );
    let producer = client(&mut engine);
    let writes = run(&mut engine, producer, &["RPUSH", "q", "v"], 7_000);
    assert_eq!(writes, vec![(producer, RespFrame::Integer(1))]);
}

#[test]
fn brpoplpush_delivers_into_destination() {
    let mut engine = engine();
    let consumer = client(&mut engine);
    let producer = client(&mut engine);
    assert!(run(&mut engine, consumer, &["BRPOPLPUSH", "src", "dst", "0"], 0).is_empty());
    let writes = run(&mut engine, producer, &["RPUSH", "src", "task"], 1);
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], (consumer, bulk("task")));
    assert_eq!(
        reply(&mut engine, producer, &["LRANGE", "dst", "0", "-1"], 2),
        RespFrame::array(vec![bulk("task")])
    );
}

#[test]
fn blpop_immediate_when_data_present() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["RPUSH", "q", "ready"], 0);
    assert_eq!(
        reply(&mut engine, id, &["BLPOP", "q", "0"], 1),
        RespFrame::array(vec![bulk("q"), bulk("ready")])
    );
}

#[test]
fn set_operations() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SADD", "a", "1", "2", "3"], 0);
    reply(&mut engine, id, &["SADD", "b", "2", "3", "4"], 0);
    let inter = reply(&mut engine, id, &["SINTER", "a", "b"], 0);
    let RespFrame::Array(Some(items)) = inter else {
        panic!("expected array");
    };
    let mut members: Vec<Vec<u8>> = items
        .into_iter()
        .map(|frame| match frame {
            RespFrame::BulkString(Some(bytes)) => bytes,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    members.sort();
    assert_eq!(members, vec![b"2".to_vec(), b"3".to_vec()]);
    assert_eq!(
        reply(&mut engine, id, &["SUNIONSTORE", "dest", "a", "b"], 0),
        RespFrame::Integer(4)
    );
    assert_eq!(
        reply(&mut engine, id, &["SCARD", "dest"], 0),
        RespFrame::Integer(4)
    );
    assert_eq!(
        reply(&mut engine, id, &["SMOVE", "a", "b", "1"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(
        reply(&mut engine, id, &["SISMEMBER", "b", "1"], 0),
        RespFrame::Integer(1)
    );
}

#[test]
fn zadd_zrange_scenario() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["ZADD", "z", "1", "a", "2", "b", "3", "c"], 0),
        RespFrame::Integer(3)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZRANGE", "z", "0", "-1"], 0),
        RespFrame::array(vec![bulk("a"), bulk("b"), bulk("c")])
    );
    assert_eq!(
        reply(&mut engine, id, &["ZRANGE", "z", "0", "-1", "WITHSCORES"], 0),
        RespFrame::array(vec![
            bulk("a"),
            bulk("1"),
            bulk("b"),
            bulk("2"),
            bulk("c"),
            bulk("3"),
        ])
    );
    assert_eq!(reply(&mut engine, id, &["ZINCRBY", "z", "5", "a"], 0), bulk("6"));
    assert_eq!(reply(&mut engine, id, &["ZSCORE", "z", "a"], 0), bulk("6"));
    assert_eq!(
        reply(&mut engine, id, &["ZRANK", "z", "a"], 0),
        RespFrame::Integer(2)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZCARD", "z"], 0),
        RespFrame::Integer(3)
    );
}

#[test]
fn zcount_and_zrangebyscore() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["ZADD", "z", "1", "a", "2", "b", "3", "c"], 0);
    assert_eq!(
        reply(&mut engine, id, &["ZCOUNT", "z", "1", "3"], 0),
        RespFrame::Integer(3)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZCOUNT", "z", "(1", "3"], 0),
        RespFrame::Integer(2)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZRANGEBYSCORE", "z", "2", "+inf"], 0),
        RespFrame::array(vec![bulk("b"), bulk("c")])
    );
    assert_eq!(
        reply(
            &mut engine,
            id,
            &["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "1", "1"],
            0
        ),
        RespFrame::array(vec![bulk("b")])
    );
}

#[test]
fn zrem_and_range_removals() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["ZADD", "z", "1", "a", "2", "b", "3", "c", "4", "d"], 0);
    assert_eq!(
        reply(&mut engine, id, &["ZREM", "z", "a", "nope"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZREMRANGEBYSCORE", "z", "3", "4"], 0),
        RespFrame::Integer(2)
    );
    assert_eq!(
        reply(&mut engine, id, &["ZRANGE", "z", "0", "-1"], 0),
        RespFrame::array(vec![bulk("b")])
    );
    assert_eq!(
        reply(&mut engine, id, &["ZREMRANGEBYRANK", "z", "0", "-1"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(reply(&mut engine, id, &["EXISTS", "z"], 0), RespFrame::Integer(0));
}

#[test]
fn zunionstore_with_weights_and_aggregate() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["ZADD", "z1", "1", "a", "2", "b"], 0);
    reply(&mut engine, id, &["ZADD", "z2", "10", "b", "4", "c"], 0);
    assert_eq!(
        reply(
            &mut engine,
            id,
            &["ZUNIONSTORE", "out", "2", "z1", "z2", "WEIGHTS", "2", "1"],
            0
        ),
        RespFrame::Integer(3)
    );
    assert_eq!(reply(&mut engine, id, &["ZSCORE", "out", "b"], 0), bulk("14"));
    assert_eq!(
        reply(
            &mut engine,
            id,
            &["ZINTERSTORE", "out2", "2", "z1", "z2", "AGGREGATE", "MIN"],
            0
        ),
        RespFrame::Integer(1)
    );
    assert_eq!(reply(&mut engine, id, &["ZSCORE", "out2", "b"], 0), bulk("2"));
}

#[test]
fn multi_exec_scenario() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(reply(&mut engine, id, &["MULTI"], 0), ok());
    assert_eq!(
        reply(&mut engine, id, &["SET", "x", "1"], 0),
        RespFrame::SimpleString("QUEUED".to_owned())
    );
    assert_eq!(
        reply(&mut engine, id, &["INCR", "x"], 0),
        RespFrame::SimpleString("QUEUED".to_owned())
    );
    assert_eq!(
        reply(&mut engine, id, &["EXEC"], 0),
        RespFrame::array(vec![ok(), RespFrame::Integer(2)])
    );
    assert_eq!(reply(&mut engine, id, &["GET", "x"], 0), bulk("2"));
}

#[test]
fn watch_aborts_exec_when_key_changes() {
    let mut engine = engine();
    let watcher = client(&mut engine);
    let intruder = client(&mut engine);
    reply(&mut engine, watcher, &["SET", "k", "0"], 0);
    assert_eq!(reply(&mut engine, watcher, &["WATCH", "k"], 0), ok());
    assert_eq!(reply(&mut engine, watcher, &["MULTI"], 0), ok());
    reply(&mut engine, watcher, &["INCR", "k"], 0);
    // Another client touches the watched key before EXEC.
    reply(&mut engine, intruder, &["SET", "k", "99"], 0);
    assert_eq!(
        reply(&mut engine, watcher, &["EXEC"], 0),
        RespFrame::array(Vec::new())
    );
    assert_eq!(reply(&mut engine, watcher, &["GET", "k"], 0), bulk("99"));
}

#[test]
fn watch_untouched_key_lets_exec_run() {
    let mut engine = engine();
    let watcher = client(&mut engine);
    let other = client(&mut engine);
    reply(&mut engine, watcher, &["SET", "k", "0"], 0);
    reply(&mut engine, watcher, &["WATCH", "k"], 0);
    reply(&mut engine, watcher, &["MULTI"], 0);
    reply(&mut engine, watcher, &["INCR", "k"], 0);
    // A write to an unrelated key does not poison the watch.
    reply(&mut engine, other, &["SET", "unrelated", "1"], 0);
    assert_eq!(
        reply(&mut engine, watcher, &["EXEC"], 0),
        RespFrame::array(vec![RespFrame::Integer(1)])
    );
}

#[test]
fn discard_drops_the_queue() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["MULTI"], 0);
    reply(&mut engine, id, &["SET", "x", "1"], 0);
    assert_eq!(reply(&mut engine, id, &["DISCARD"], 0), ok());
    assert_eq!(reply(&mut engine, id, &["GET", "x"], 0), RespFrame::null());
    assert_eq!(
        reply(&mut engine, id, &["EXEC"], 0),
        RespFrame::Error("ERR EXEC without MULTI".to_owned())
    );
}

#[test]
fn flushdb_poisons_every_watcher() {
    let mut engine = engine();
    let watcher = client(&mut engine);
    let flusher = client(&mut engine);
    reply(&mut engine, watcher, &["WATCH", "anything"], 0);
    reply(&mut engine, watcher, &["MULTI"], 0);
    reply(&mut engine, watcher, &["PING"], 0);
    reply(&mut engine, flusher, &["FLUSHDB"], 0);
    assert_eq!(
        reply(&mut engine, watcher, &["EXEC"], 0),
        RespFrame::array(Vec::new())
    );
}

#[test]
fn pubsub_exact_channel_delivery() {
    let mut engine = engine();
    let subscriber = client(&mut engine);
    let publisher = client(&mut engine);
    let writes = run(&mut engine, subscriber, &["SUBSCRIBE", "news"], 0);
    assert_eq!(
        writes,
        vec![(
            subscriber,
            RespFrame::array(vec![bulk("subscribe"), bulk("news"), RespFrame::Integer(1)])
        )]
    );
    let writes = run(&mut engine, publisher, &["PUBLISH", "news", "hi"], 1);
    assert_eq!(writes.len(), 2);
    assert_eq!(
        writes[0],
        (
            subscriber,
            RespFrame::array(vec![bulk("message"), bulk("news"), bulk("hi")])
        )
    );
    assert_eq!(writes[1], (publisher, RespFrame::Integer(1)));
}

#[test]
fn pubsub_pattern_delivery_uses_pmessage() {
    let mut engine = engine();
    let subscriber = client(&mut engine);
    let publisher = client(&mut engine);
    run(&mut engine, subscriber, &["PSUBSCRIBE", "news.*"], 0);
    let writes = run(&mut engine, publisher, &["PUBLISH", "news.tech", "x"], 1);
    assert_eq!(writes.len(), 2);
    assert_eq!(
        writes[0],
        (
            subscriber,
            RespFrame::array(vec![
                bulk("pmessage"),
                bulk("news.*"),
                bulk("news.tech"),
                bulk("x"),
            ])
        )
    );
    let writes = run(&mut engine, publisher, &["PUBLISH", "sport.cricket", "y"], 2);
    assert_eq!(writes, vec![(publisher, RespFrame::Integer(0))]);
}

#[test]
fn subscriber_is_gated_to_pubsub_commands() {
    let mut engine = engine();
    let subscriber = client(&mut engine);
    run(&mut engine, subscriber, &["SUBSCRIBE", "c"], 0);
    let err = reply(&mut engine, subscriber, &["GET", "k"], 1);
    assert!(matches!(err, RespFrame::Error(ref m) if m.contains("(P)SUBSCRIBE")));
    // UNSUBSCRIBE leaves pub/sub mode.
    let writes = run(&mut engine, subscriber, &["UNSUBSCRIBE"], 2);
    assert_eq!(writes.len(), 1);
    assert_eq!(reply(&mut engine, subscriber, &["GET", "k"], 3), RespFrame::null());
}

#[test]
fn pubsub_introspection() {
    let mut engine = engine();
    let subscriber = client(&mut engine);
    let observer = client(&mut engine);
    run(&mut engine, subscriber, &["SUBSCRIBE", "alpha"], 0);
    run(&mut engine, subscriber, &["PSUBSCRIBE", "beta.*"], 0);
    assert_eq!(
        reply(&mut engine, observer, &["PUBSUB", "CHANNELS"], 1),
        RespFrame::array(vec![bulk("alpha")])
    );
    let numsub = reply(&mut engine, observer, &["PUBSUB", "NUMSUB", "alpha", "ghost"], 2);
    assert_eq!(
        numsub,
        RespFrame::array(vec![
            bulk("alpha"),
            RespFrame::Integer(1),
            bulk("ghost"),
            RespFrame::Integer(0),
        ])
    );
    assert_eq!(
        reply(&mut engine, observer, &["PUBSUB", "NUMPAT"], 3),
        RespFrame::Integer(1)
    );
}

#[test]
fn disconnect_purges_subscriptions_and_waiters() {
    let mut engine = engine();
    let subscriber = client(&mut engine);
    run(&mut engine, subscriber, &["SUBSCRIBE", "c"], 0);
    engine.disconnect(subscriber);
    let publisher = client(&mut engine);
    let writes = run(&mut engine, publisher, &["PUBLISH", "c", "m"], 1);
    assert_eq!(writes, vec![(publisher, RespFrame::Integer(0))]);

    let blocked = client(&mut engine);
    assert!(run(&mut engine, blocked, &["BLPOP", "q", "0"], 2).is_empty());
    engine.disconnect(blocked);
    let writes = run(&mut engine, publisher, &["RPUSH", "q", "v"], 3);
    assert_eq!(writes, vec![(publisher, RespFrame::Integer(1))]);
}

#[test]
fn auth_gate_when_password_configured() {
    let mut config = Config::default();
    config.password = Some(b"sesame".to_vec());
    let mut engine = Engine::new(config, 0);
    let id = engine.connect("127.0.0.1:1", 0);
    let err = reply(&mut engine, id, &["GET", "k"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.starts_with("NOAUTH")));
    assert_eq!(
        reply(&mut engine, id, &["AUTH", "wrong"], 0),
        RespFrame::Error("ERR wrong password".to_owned())
    );
    assert_eq!(reply(&mut engine, id, &["AUTH", "sesame"], 0), ok());
    assert_eq!(reply(&mut engine, id, &["GET", "k"], 0), RespFrame::null());
}

#[test]
fn select_and_move_between_databases() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "k", "v"], 0);
    assert_eq!(reply(&mut engine, id, &["MOVE", "k", "3"], 0), RespFrame::Integer(1));
    assert_eq!(reply(&mut engine, id, &["EXISTS", "k"], 0), RespFrame::Integer(0));
    assert_eq!(reply(&mut engine, id, &["SELECT", "3"], 0), ok());
    assert_eq!(reply(&mut engine, id, &["GET", "k"], 0), bulk("v"));
    let err = reply(&mut engine, id, &["SELECT", "99"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.contains("database number")));
}

#[test]
fn rename_and_renamenx() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "a", "1"], 0);
    reply(&mut engine, id, &["SET", "b", "2"], 0);
    assert_eq!(reply(&mut engine, id, &["RENAMENX", "a", "b"], 0), RespFrame::Integer(0));
    assert_eq!(reply(&mut engine, id, &["RENAME", "a", "c"], 0), ok());
    assert_eq!(reply(&mut engine, id, &["GET", "c"], 0), bulk("1"));
    let err = reply(&mut engine, id, &["RENAME", "missing", "x"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.contains("Cannot rename")));
}

#[test]
fn keys_glob_and_dbsize() {
    let mut engine = engine();
    let id = client(&mut engine);
    for key in ["one", "two", "three"] {
        reply(&mut engine, id, &["SET", key, "v"], 0);
    }
    assert_eq!(reply(&mut engine, id, &["DBSIZE"], 0), RespFrame::Integer(3));
    let matched = reply(&mut engine, id, &["KEYS", "t*"], 0);
    let RespFrame::Array(Some(items)) = matched else {
        panic!("expected array");
    };
    let mut names: Vec<Vec<u8>> = items
        .into_iter()
        .map(|frame| match frame {
            RespFrame::BulkString(Some(bytes)) => bytes,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec![b"three".to_vec(), b"two".to_vec()]);
}

#[test]
fn dump_restore_round_trips_a_zset() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["ZADD", "z", "1", "a", "2", "b"], 0);
    let dumped = reply(&mut engine, id, &["DUMP", "z"], 0);
    let RespFrame::BulkString(Some(blob)) = dumped else {
        panic!("expected blob");
    };
    let writes = engine.dispatch(
        id,
        vec![b"restore".to_vec(), b"z2".to_vec(), b"0".to_vec(), blob],
        0,
    );
    assert_eq!(writes.writes[0].1, ok());
    assert_eq!(
        reply(&mut engine, id, &["ZRANGE", "z2", "0", "-1"], 0),
        RespFrame::array(vec![bulk("a"), bulk("b")])
    );
    let err = reply(&mut engine, id, &["RESTORE", "bad", "0", "garbage"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.contains("Could not decode")));
}

#[test]
fn sort_numeric_alpha_by_and_store() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["RPUSH", "l", "3", "1", "2"], 0);
    assert_eq!(
        reply(&mut engine, id, &["SORT", "l"], 0),
        RespFrame::array(vec![bulk("1"), bulk("2"), bulk("3")])
    );
    assert_eq!(
        reply(&mut engine, id, &["SORT", "l", "DESC"], 0),
        RespFrame::array(vec![bulk("3"), bulk("2"), bulk("1")])
    );
    assert_eq!(
        reply(&mut engine, id, &["SORT", "l", "LIMIT", "0", "2"], 0),
        RespFrame::array(vec![bulk("1"), bulk("2")])
    );
    // BY weight_* with GET value lookups.
    for (key, value) in [("weight_1", "30"), ("weight_2", "20"), ("weight_3", "10")] {
        reply(&mut engine, id, &["SET", key, value], 0);
    }
    assert_eq!(
        reply(&mut engine, id, &["SORT", "l", "BY", "weight_*"], 0),
        RespFrame::array(vec![bulk("3"), bulk("2"), bulk("1")])
    );
    assert_eq!(
        reply(
            &mut engine,
            id,
            &["SORT", "l", "BY", "weight_*", "GET", "weight_*", "GET", "#"],
            0
        ),
        RespFrame::array(vec![
            bulk("10"),
            bulk("3"),
            bulk("20"),
            bulk("2"),
            bulk("30"),
            bulk("1"),
        ])
    );
    assert_eq!(
        reply(&mut engine, id, &["SORT", "l", "STORE", "sorted"], 0),
        RespFrame::Integer(3)
    );
    assert_eq!(
        reply(&mut engine, id, &["LRANGE", "sorted", "0", "-1"], 0),
        RespFrame::array(vec![bulk("1"), bulk("2"), bulk("3")])
    );
}

#[test]
fn msetnx_is_all_or_nothing() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["MSETNX", "a", "1", "b", "2"], 0),
        RespFrame::Integer(1)
    );
    assert_eq!(
        reply(&mut engine, id, &["MSETNX", "b", "9", "c", "3"], 0),
        RespFrame::Integer(0)
    );
    assert_eq!(reply(&mut engine, id, &["EXISTS", "c"], 0), RespFrame::Integer(0));
    assert_eq!(reply(&mut engine, id, &["GET", "b"], 0), bulk("2"));
}

#[test]
fn monitor_sees_commands() {
    let mut engine = engine();
    let monitor = client(&mut engine);
    let worker = client(&mut engine);
    assert_eq!(reply(&mut engine, monitor, &["MONITOR"], 0), ok());
    let writes = run(&mut engine, worker, &["SET", "k", "v"], 1_234);
    assert_eq!(writes.len(), 2);
    let (target, RespFrame::SimpleString(line)) = &writes[0] else {
        panic!("expected monitor feed line");
    };
    assert_eq!(*target, monitor);
    assert!(line.contains("\"SET\""));
    assert!(line.contains("\"k\""));
    assert_eq!(writes[1], (worker, ok()));
}

#[test]
fn info_reports_sections_and_stats() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "k", "v"], 0);
    reply(&mut engine, id, &["GET", "k"], 0);
    reply(&mut engine, id, &["GET", "missing"], 0);
    let info = reply(&mut engine, id, &["INFO"], 0);
    let RespFrame::BulkString(Some(text)) = info else {
        panic!("expected bulk");
    };
    let text = String::from_utf8(text).expect("utf8");
    assert!(text.contains("#server"));
    assert!(text.contains("#keyspace"));
    assert!(text.contains("db0:keys=1,expires=0"));
    assert!(text.contains("keyspace_hits:1"));
    assert!(text.contains("keyspace_misses:1"));
}

#[test]
fn quit_closes_after_reply() {
    let mut engine = engine();
    let id = client(&mut engine);
    let result = engine.dispatch(id, argv(&["QUIT"]), 0);
    assert_eq!(result.writes, vec![(id, ok())]);
    assert!(result.close);
}

#[test]
fn getset_and_randomkey() {
    let mut engine = engine();
    let id = client(&mut engine);
    assert_eq!(
        reply(&mut engine, id, &["GETSET", "k", "new"], 0),
        RespFrame::null()
    );
    assert_eq!(reply(&mut engine, id, &["GETSET", "k", "newer"], 0), bulk("new"));
    let random = reply(&mut engine, id, &["RANDOMKEY"], 0);
    assert_eq!(random, bulk("k"));
}

#[test]
fn expired_key_no_longer_counts_in_dbsize() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "a", "1"], 0);
    reply(&mut engine, id, &["SET", "b", "2", "PX", "500"], 0);
    assert_eq!(reply(&mut engine, id, &["DBSIZE"], 0), RespFrame::Integer(2));
    engine.on_tick(500);
    assert_eq!(reply(&mut engine, id, &["DBSIZE"], 600), RespFrame::Integer(1));
}

#[test]
fn snapshot_save_and_reload() {
    let dir = std::env::temp_dir().join(format!("qs-command-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    let path = dir.join("dump.qsdb");
    let mut config = Config::default();
    config.filename = path.to_string_lossy().into_owned();
    config.save_points = vec![qs_config::SavePoint { seconds: 1, changes: 1 }];

    let mut engine = Engine::new(config.clone(), 0);
    let id = engine.connect("127.0.0.1:1", 0);
    reply(&mut engine, id, &["SET", "persisted", "yes"], 0);
    reply(&mut engine, id, &["SAVE"], 0);

    let mut restored = Engine::new(config, 10);
    let id = restored.connect("127.0.0.1:2", 10);
    assert_eq!(reply(&mut restored, id, &["GET", "persisted"], 10), bulk("yes"));
    std::fs::remove_dir_all(&dir).expect("cleanup");
}

#[test]
fn save_cron_triggers_on_dirty_writes() {
    let dir = std::env::temp_dir().join(format!("qs-command-cron-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    let path = dir.join("dump.qsdb");
    let mut config = Config::default();
    config.filename = path.to_string_lossy().into_owned();
    config.save_points = vec![qs_config::SavePoint { seconds: 1, changes: 1 }];

    let mut engine = Engine::new(config, 0);
    let id = engine.connect("127.0.0.1:1", 0);
    reply(&mut engine, id, &["SET", "k", "v"], 100);
    // First cron tick runs the save check after the trigger window.
    engine.on_tick(2_000);
    assert!(path.exists());
    std::fs::remove_dir_all(&dir).expect("cleanup");
}

#[test]
fn frame_to_argv_accepts_request_arrays() {
    let frame = RespFrame::array(vec![bulk("GET"), bulk("key")]);
    assert_eq!(
        frame_to_argv(&frame).expect("argv"),
        vec![b"GET".to_vec(), b"key".to_vec()]
    );
    assert!(matches!(
        frame_to_argv(&RespFrame::Integer(3)),
        Err(CommandError::Custom(_))
    ));
}

mod model {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use qs_protocol::RespFrame;

    use super::{client, engine};

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, Vec<u8>),
        Get(u8),
        Del(u8),
        Append(u8, Vec<u8>),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        let bytes = proptest::collection::vec(any::<u8>(), 0..12);
        prop_oneof![
            (0u8..6, bytes.clone()).prop_map(|(k, v)| Op::Set(k, v)),
            (0u8..6).prop_map(Op::Get),
            (0u8..6).prop_map(Op::Del),
            (0u8..6, bytes).prop_map(|(k, v)| Op::Append(k, v)),
        ]
    }

    fn key_name(k: u8) -> Vec<u8> {
        format!("key{k}").into_bytes()
    }

    proptest! {
        // The string keyspace behaves like a plain map under
        // SET/GET/DEL/APPEND, whatever the interleaving.
        #[test]
        fn string_commands_track_a_map_model(ops in proptest::collection::vec(arb_op(), 1..60)) {
            let mut engine = engine();
            let id = client(&mut engine);
            let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        let parts = vec![b"set".to_vec(), key_name(k), v.clone()];
                        engine.dispatch(id, parts, 0);
                        model.insert(key_name(k), v);
                    }
                    Op::Del(k) => {
                        engine.dispatch(id, vec![b"del".to_vec(), key_name(k)], 0);
                        model.remove(&key_name(k));
                    }
                    Op::Append(k, v) => {
                        let parts = vec![b"append".to_vec(), key_name(k), v.clone()];
                        engine.dispatch(id, parts, 0);
                        model.entry(key_name(k)).or_default().extend_from_slice(&v);
                    }
                    Op::Get(k) => {
                        let writes = engine
                            .dispatch(id, vec![b"get".to_vec(), key_name(k)], 0)
                            .writes;
                        let expected = match model.get(&key_name(k)) {
                            Some(v) => RespFrame::BulkString(Some(v.clone())),
                            None => RespFrame::BulkString(None),
                        };
                        prop_assert_eq!(&writes[0].1, &expected);
                    }
                }
            }
        }
    }
}

#[test]
fn blocked_client_wrongtype_key_short_circuits() {
    let mut engine = engine();
    let id = client(&mut engine);
    reply(&mut engine, id, &["SET", "notalist", "v"], 0);
    let err = reply(&mut engine, id, &["BLPOP", "notalist", "0"], 0);
    assert!(matches!(err, RespFrame::Error(ref m) if m.starts_with("WRONGTYPE")));
}
