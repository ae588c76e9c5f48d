use crate::flags::flag_request::FlagRequestType;
use anyhow::Result;
use common_redis::{Client as RedisClient, CustomRedisError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SURVEY_TARGETING_FLAG_PREFIX: &str = "survey-targeting-";
const CACHE_BUCKET_SIZE: u64 = 60 * 2; // duration in seconds

pub fn get_team_request_key(team_id: i32, request_type: FlagRequestType) -> String {
    match request_type {
        FlagRequestType::Decide => format!("posthog:decide_requests:{team_id}"),
        FlagRequestType::LocalEvaluation => {
            format!("posthog:local_evaluation_requests:{team_id}")
        }
    }
}

pub async fn increment_request_count(
    redis_client: Arc<dyn RedisClient + Send + Sync>,
    team_id: i32,
    count: i32,
    request_type: FlagRequestType,
) -> Result<(), CustomRedisError> {
    let time_bucket = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        / CACHE_BUCKET_SIZE;
    let key_name = get_team_request_key(team_id, request_type);
    redis_client
        .hincrby(key_name, time_bucket.to_string(), Some(count))
        .await?;
    Ok(())
}
