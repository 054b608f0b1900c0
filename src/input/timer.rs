use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use super::{
    definition::TimerInputConfig,
    runtime::{stopped, Emitter},
};
use crate::event::model::Meta;

const DEFAULT_INTERVAL_MS: u64 = 1000;

pub fn interval_of(config: &TimerInputConfig) -> Duration {
    match config.interval_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(DEFAULT_INTERVAL_MS),
    }
}

fn tick_payload(config: &TimerInputConfig, seq: u64) -> Value {
    let now = Utc::now();
    let mut payload = match &config.payload {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    payload.insert(
        "now".to_string(),
        json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    payload.insert("epochMs".to_string(), json!(now.timestamp_millis()));
    payload.insert("seq".to_string(), json!(seq));
    Value::Object(payload)
}

pub async fn run(config: TimerInputConfig, emitter: Emitter, mut stop: watch::Receiver<bool>) {
    let interval = interval_of(&config);
    debug!("Timer input {} every {:?}", emitter.id(), interval);
    let mut meta = Meta::new();
    meta.insert("timer".to_string(), Value::Bool(true));

    let mut seq = 0u64;
    if config.emit_on_start {
        emitter.emit(tick_payload(&config, seq), meta.clone());
        seq += 1;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                emitter.emit(tick_payload(&config, seq), meta.clone());
                seq += 1;
            }
            _ = stopped(&mut stop) => break,
        }
    }
    debug!("Timer input {} stopped", emitter.id());
}
