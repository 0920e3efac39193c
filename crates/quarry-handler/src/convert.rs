//! Mapping between runtime types and operator packets.

use quarry_config::{ConfigDataType, RuleValue};
use quarry_protocol::operator::{ChatLine, ChunkState, InfoUpdate, OnlinePlayer, TaskAction, Utilisation};
use quarry_protocol::{ConfigRuleDesc, DataType, Value};
use quarry_query::SchedulerStats;
use quarry_task::{ChunkObservation, RuleSnapshot, TaskEvent, TaskInfo};

/// Progress sent for tasks that cannot estimate it.
pub const UNKNOWN_PROGRESS: f32 = -1.0;

pub fn rule_value(value: &RuleValue) -> Value {
    match value {
        RuleValue::String(s) => Value::String(s.clone()),
        RuleValue::Integer(i) => Value::Integer(*i),
        RuleValue::Float(x) => Value::Float(*x),
        RuleValue::Boolean(b) => Value::Boolean(*b),
        RuleValue::Enum(s) => Value::Enum(s.clone()),
    }
}

/// `None` for value types no config rule can hold.
pub fn to_rule_value(value: &Value) -> Option<RuleValue> {
    Some(match value {
        Value::String(s) => RuleValue::String(s.clone()),
        Value::Integer(i) => RuleValue::Integer(*i),
        Value::Float(x) => RuleValue::Float(*x),
        Value::Boolean(b) => RuleValue::Boolean(*b),
        Value::Enum(s) => RuleValue::Enum(s.clone()),
        Value::Position(_) | Value::Angle(_) | Value::ChunkPosition(_) => return None,
    })
}

pub fn rule_desc(rule: &RuleSnapshot) -> ConfigRuleDesc {
    let (data_type, enum_values) = match rule.data_type {
        ConfigDataType::String => (DataType::String, Vec::new()),
        ConfigDataType::Integer => (DataType::Integer, Vec::new()),
        ConfigDataType::Float => (DataType::Float, Vec::new()),
        ConfigDataType::Boolean => (DataType::Boolean, Vec::new()),
        ConfigDataType::Enum(values) => (
            DataType::Enum,
            values.iter().map(|v| (*v).to_owned()).collect(),
        ),
    };
    ConfigRuleDesc {
        name: rule.name.clone(),
        data_type,
        enum_values,
        gettable: rule.gettable,
        settable: rule.settable,
    }
}

pub fn task_action(event: TaskEvent) -> TaskAction {
    match event {
        TaskEvent::Added {
            task_id,
            name,
            params,
        } => TaskAction::Add {
            task_id,
            name,
            params,
        },
        TaskEvent::Removed { task_id } => TaskAction::Remove { task_id },
        TaskEvent::Updated {
            task_id,
            progress,
            elapsed_ms,
            position,
        } => TaskAction::Update {
            task_id,
            progress: progress.unwrap_or(UNKNOWN_PROGRESS),
            elapsed_ms,
            position,
        },
        TaskEvent::Result { task_id, result } => TaskAction::Result { task_id, result },
    }
}

/// Everything needed to recreate an active task remotely: add, current
/// progress, then each result so far.
pub fn task_sync(info: &TaskInfo) -> Vec<TaskAction> {
    let mut actions = vec![
        TaskAction::Add {
            task_id: info.task_id,
            name: info.name.clone(),
            params: info.params.clone(),
        },
        TaskAction::Update {
            task_id: info.task_id,
            progress: info.progress.unwrap_or(UNKNOWN_PROGRESS),
            elapsed_ms: info.elapsed_ms,
            position: info.position,
        },
    ];
    actions.extend(info.results.iter().map(|result| TaskAction::Result {
        task_id: info.task_id,
        result: result.clone(),
    }));
    actions
}

pub fn info_update(stats: &SchedulerStats, accounts_online: usize) -> InfoUpdate {
    InfoUpdate {
        waiting: saturate(stats.waiting),
        ticking: saturate(stats.ticking),
        processed_per_second: stats.processed_per_second,
        rescheduled_per_second: stats.rescheduled_per_second,
        dropped: i64::try_from(stats.dropped).unwrap_or(i64::MAX),
        utilisation: stats
            .utilisation
            .iter()
            .map(|u| Utilisation {
                class: u.class.to_owned(),
                dimension: u.dimension,
                rate: u.rate,
                max_throughput: u.max_throughput,
            })
            .collect(),
        accounts_online: saturate(accounts_online),
    }
}

fn saturate(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

pub fn chunk_state(obs: &ChunkObservation) -> ChunkState {
    ChunkState {
        pos: obs.pos,
        dimension: obs.dimension,
        loaded: obs.loaded,
        timestamp: obs.timestamp,
    }
}

pub fn chat_line(account: String, message: String, timestamp: i64) -> ChatLine {
    ChatLine {
        account,
        message,
        timestamp,
    }
}

pub fn online_player((uuid, name): (u128, String)) -> OnlinePlayer {
    OnlinePlayer { uuid, name }
}
