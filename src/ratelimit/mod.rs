//! The decision engine: an atomic, server-side sliding-window admission
//! check over three independent quota dimensions (requests/minute, input
//! tokens/minute, output tokens/minute), executed as one indivisible
//! operation against the shared store.

use crate::error::StoreError;
use crate::keys::ApiKeyLimits;
use crate::store::RateLimitStore;
use serde::Serialize;
use std::time::Instant;

/// Which dimension caused a rejection, in canonical evaluation order.
/// `Admitted` is reported when none did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum LimitFlag {
    Admitted = 0,
    Rpm = 1,
    Input = 2,
    Output = 3,
}

impl LimitFlag {
    fn from_code(code: i64) -> Self {
        match code {
            1 => LimitFlag::Rpm,
            2 => LimitFlag::Input,
            3 => LimitFlag::Output,
            _ => LimitFlag::Admitted,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for LimitFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitFlag::Admitted => write!(f, "admitted"),
            LimitFlag::Rpm => write!(f, "rpm"),
            LimitFlag::Input => write!(f, "input_tpm"),
            LimitFlag::Output => write!(f, "output_tpm"),
        }
    }
}

/// Result of one `check_and_consume` call. The usage fields are the
/// post-prune (and, if admitted, post-increment) `RunningTotal`s.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub rpm_usage: i64,
    pub input_usage: i64,
    pub output_usage: i64,
    pub limit_flag: LimitFlag,
}

/// Lua script implementing the algorithm below. Uploaded once at startup and
/// invoked by SHA thereafter (see `crate::store::RateLimitStore`).
///
/// KEYS: rpm:z rpm:h rpm:total input:z input:h input:total output:z output:h output:total
/// ARGV: now_ms window_seconds ttl_seconds rpm_limit input_limit output_limit input_tokens output_tokens
pub const SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local window_seconds = tonumber(ARGV[2])
local ttl_seconds = tonumber(ARGV[3])
local rpm_limit = tonumber(ARGV[4])
local input_limit = tonumber(ARGV[5])
local output_limit = tonumber(ARGV[6])
local input_tokens = tonumber(ARGV[7])
local output_tokens = tonumber(ARGV[8])

local bucket = math.floor(now_ms / 1000)
local oldest = bucket - window_seconds + 1

-- prune expired bucket ids from one dimension's (z, h, total) triple and
-- return the running total after pruning.
local function prune(z_key, h_key, total_key)
    local expired = redis.call('ZRANGEBYSCORE', z_key, '-inf', oldest - 1)
    local removed = 0
    for _, id in ipairs(expired) do
        local amt = tonumber(redis.call('HGET', h_key, id)) or 0
        removed = removed + amt
        redis.call('HDEL', h_key, id)
    end
    if #expired > 0 then
        redis.call('ZREM', z_key, unpack(expired))
    end
    local total = tonumber(redis.call('GET', total_key)) or 0
    total = total - removed
    if total < 0 then
        total = 0
    end
    redis.call('SET', total_key, total)
    return total
end

local r = prune(KEYS[1], KEYS[2], KEYS[3])
local i = prune(KEYS[4], KEYS[5], KEYS[6])
local o = prune(KEYS[7], KEYS[8], KEYS[9])

local limit_flag = 0
if rpm_limit > 0 and r + 1 > rpm_limit then
    limit_flag = 1
elseif input_limit > 0 and i + input_tokens > input_limit then
    limit_flag = 2
elseif output_limit > 0 and o + output_tokens > output_limit then
    limit_flag = 3
end

if limit_flag == 0 then
    local function admit(z_key, h_key, total_key, delta)
        redis.call('ZADD', z_key, bucket, bucket)
        redis.call('HINCRBY', h_key, bucket, delta)
        redis.call('INCRBY', total_key, delta)
        redis.call('EXPIRE', z_key, ttl_seconds)
        redis.call('EXPIRE', h_key, ttl_seconds)
        redis.call('EXPIRE', total_key, ttl_seconds)
    end
    admit(KEYS[1], KEYS[2], KEYS[3], 1)
    admit(KEYS[4], KEYS[5], KEYS[6], input_tokens)
    admit(KEYS[7], KEYS[8], KEYS[9], output_tokens)
    r = r + 1
    i = i + input_tokens
    o = o + output_tokens
end

return {limit_flag == 0 and 1 or 0, r, i, o, limit_flag}
"#;

/// `check_and_consume`: the sole entry point to the decision engine.
///
/// Negative token counts are clamped to 0. If `allowed`, all three
/// dimensions have been mutated exactly as described in the module docs; if
/// not, no dimension has been mutated.
pub async fn check_and_consume(
    store: &RateLimitStore,
    limits: &ApiKeyLimits,
    window_seconds: i64,
    input_tokens: i64,
    output_tokens: i64,
) -> Result<RateLimitOutcome, StoreError> {
    let input_tokens = input_tokens.max(0);
    let output_tokens = output_tokens.max(0);
    let ttl_seconds = window_seconds + 5;
    let now_ms = now_millis();

    let keys = bucket_keys(&limits.api_key);
    let args = [
        now_ms.to_string(),
        window_seconds.to_string(),
        ttl_seconds.to_string(),
        limits.rpm.to_string(),
        limits.input_tpm.to_string(),
        limits.output_tpm.to_string(),
        input_tokens.to_string(),
        output_tokens.to_string(),
    ];

    let eval_start = Instant::now();
    let reply: Result<Vec<i64>, StoreError> = store.eval(&keys, &args).await;
    metrics::histogram!("rate_limiter_store_eval_duration_seconds").record(eval_start.elapsed().as_secs_f64());
    let reply = match reply {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!("rate_limiter_store_errors_total").increment(1);
            return Err(e);
        }
    };

    let [allowed, r, i, o, flag] = <[i64; 5]>::try_from(reply)
        .map_err(|_| StoreError::Connect("unexpected script reply shape".to_string()))?;

    Ok(RateLimitOutcome {
        allowed: allowed == 1,
        rpm_usage: r,
        input_usage: i,
        output_usage: o,
        limit_flag: LimitFlag::from_code(flag),
    })
}

/// The nine store keys for one api key, in the fixed KEYS[1..9] order the
/// Lua script expects: rpm, input, output, each as (z, h, total).
pub fn bucket_keys(api_key: &str) -> [String; 9] {
    [
        format!("rl:{api_key}:rpm:z"),
        format!("rl:{api_key}:rpm:h"),
        format!("rl:{api_key}:rpm:total"),
        format!("rl:{api_key}:input:z"),
        format!("rl:{api_key}:input:h"),
        format!("rl:{api_key}:input:total"),
        format!("rl:{api_key}:output:z"),
        format!("rl:{api_key}:output:h"),
        format!("rl:{api_key}:output:total"),
    ]
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_flag_from_code_roundtrips() {
        assert_eq!(LimitFlag::from_code(0), LimitFlag::Admitted);
        assert_eq!(LimitFlag::from_code(1), LimitFlag::Rpm);
        assert_eq!(LimitFlag::from_code(2), LimitFlag::Input);
        assert_eq!(LimitFlag::from_code(3), LimitFlag::Output);
    }

    #[test]
    fn bucket_keys_are_namespaced_per_dimension() {
        let keys = bucket_keys("sk-test");
        assert_eq!(keys[0], "rl:sk-test:rpm:z");
        assert_eq!(keys[2], "rl:sk-test:rpm:total");
        assert_eq!(keys[5], "rl:sk-test:input:total");
        assert_eq!(keys[8], "rl:sk-test:output:total");
    }
}
