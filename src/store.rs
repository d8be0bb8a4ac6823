//! The shared key-value store abstraction (§6). Every component depends on
//! the `Store` trait, not the concrete Redis client, so the round-freeze and
//! commit-atomicity properties (§8) are testable against an in-memory fake.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

/// One command in an atomic batch, mirroring the MULTI/EXEC surface in §6.
#[derive(Debug, Clone)]
pub enum StoreCommand {
    HIncrBy { key: String, field: String, delta: i64 },
    HIncrByFloat { key: String, field: String, delta: f64 },
    HSet { key: String, field: String, value: String },
    SAdd { key: String, member: String },
    SMove { src: String, dst: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    Rename { from: String, to: String },
    Del { key: String },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;
    async fn exec_transaction(&self, commands: Vec<StoreCommand>) -> anyhow::Result<()>;
}

/// Redis-backed implementation used in production.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn exec_transaction(&self, commands: Vec<StoreCommand>) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in &commands {
            match cmd {
                StoreCommand::HIncrBy { key, field, delta } => {
                    pipe.hincr(key, field, *delta);
                }
                StoreCommand::HIncrByFloat { key, field, delta } => {
                    pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(*delta);
                }
                StoreCommand::HSet { key, field, value } => {
                    pipe.hset(key, field, value);
                }
                StoreCommand::SAdd { key, member } => {
                    pipe.sadd(key, member);
                }
                StoreCommand::SMove { src, dst, member } => {
                    pipe.smove(src, dst, member);
                }
                StoreCommand::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score);
                }
                StoreCommand::Rename { from, to } => {
                    pipe.cmd("RENAME").arg(from).arg(to);
                }
                StoreCommand::Del { key } => {
                    pipe.del(key);
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// Renders a command list the way the recovery dump (§4.8 post-send failure
/// path) serializes it to `<coin>_finalRedisCommands.txt`.
pub fn render_recovery_commands(commands: &[StoreCommand]) -> String {
    commands
        .iter()
        .map(|c| format!("{:?}", c))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inverse of `render_recovery_commands`, for `--replay-recovery`: re-parses
/// the `{:?}`-derived dump back into commands an operator can replay after
/// intervening on a failed commit.
pub fn parse_recovery_commands(text: &str) -> anyhow::Result<Vec<StoreCommand>> {
    text.lines().filter(|l| !l.trim().is_empty()).map(parse_recovery_line).collect()
}

fn parse_recovery_line(line: &str) -> anyhow::Result<StoreCommand> {
    let (variant, rest) = line
        .trim()
        .split_once('{')
        .ok_or_else(|| anyhow::anyhow!("malformed recovery line: {line}"))?;
    let variant = variant.trim();
    let body = rest.trim().strip_suffix('}').unwrap_or(rest.trim());
    let fields = split_top_level_fields(body);
    let get = |name: &str| -> anyhow::Result<String> {
        fields
            .iter()
            .find_map(|(k, v)| (*k == name).then(|| v.clone()))
            .ok_or_else(|| anyhow::anyhow!("recovery line missing field {name}: {line}"))
    };
    let string_field = |name: &str| -> anyhow::Result<String> {
        let raw = get(name)?;
        Ok(raw.trim_matches('"').to_string())
    };

    Ok(match variant {
        "HIncrBy" => StoreCommand::HIncrBy { key: string_field("key")?, field: string_field("field")?, delta: get("delta")?.parse()? },
        "HIncrByFloat" => {
            StoreCommand::HIncrByFloat { key: string_field("key")?, field: string_field("field")?, delta: get("delta")?.parse()? }
        }
        "HSet" => StoreCommand::HSet { key: string_field("key")?, field: string_field("field")?, value: string_field("value")? },
        "SAdd" => StoreCommand::SAdd { key: string_field("key")?, member: string_field("member")? },
        "SMove" => StoreCommand::SMove { src: string_field("src")?, dst: string_field("dst")?, member: string_field("member")? },
        "ZAdd" => StoreCommand::ZAdd { key: string_field("key")?, score: get("score")?.parse()?, member: string_field("member")? },
        "Rename" => StoreCommand::Rename { from: string_field("from")?, to: string_field("to")? },
        "Del" => StoreCommand::Del { key: string_field("key")? },
        other => anyhow::bail!("unknown recovery command variant: {other}"),
    })
}

/// Splits `key: "a, b", delta: 1` on top-level commas, respecting quoted
/// strings so commas inside values don't get mistaken for separators.
fn split_top_level_fields(body: &str) -> Vec<(&str, String)> {
    let mut fields = Vec::new();
    let mut depth_in_quotes = false;
    let mut start = 0;
    let bytes = body.as_bytes();
    let mut push_segment = |segment: &str, out: &mut Vec<(&str, String)>| {
        let Some((key, value)) = segment.split_once(':') else { return };
        out.push((key.trim(), value.trim().to_string()));
    };
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' {
            depth_in_quotes = !depth_in_quotes;
        } else if b == b',' && !depth_in_quotes {
            push_segment(&body[start..i], &mut fields);
            start = i + 1;
        }
    }
    push_segment(&body[start..], &mut fields);
    fields
}


#[cfg(test)]
mod recovery_tests {
    use super::*;

    #[test]
    fn recovery_dump_round_trips_through_render_and_parse() {
        let commands = vec![
            StoreCommand::HSet { key: "shares:round100".into(), field: "alice, the miner".into(), value: "42".into() },
            StoreCommand::HIncrByFloat { key: "balances".into(), field: "bob".into(), delta: 1.5 },
            StoreCommand::SMove { src: "blocksPending".into(), dst: "blocksOrphaned".into(), member: "abcd:100".into() },
            StoreCommand::Del { key: "shares:round100".into() },
        ];
        let rendered = render_recovery_commands(&commands);
        let parsed = parse_recovery_commands(&rendered).unwrap();

        match &parsed[0] {
            StoreCommand::HSet { key, field, value } => {
                assert_eq!(key, "shares:round100");
                assert_eq!(field, "alice, the miner");
                assert_eq!(value, "42");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        match &parsed[1] {
            StoreCommand::HIncrByFloat { delta, .. } => assert_eq!(*delta, 1.5),
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(matches!(&parsed[2], StoreCommand::SMove { .. }));
        assert!(matches!(&parsed[3], StoreCommand::Del { .. }));
    }
}
