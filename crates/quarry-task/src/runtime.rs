//! The tick thread: owns the scheduler, the task engine and the live config,
//! and is driven by commands from connection threads.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use quarry_config::{Config, ConfigDataType, RuleTable, RuleValue};
use quarry_protocol::game::{ChatMessage, PlayerListAction};
use quarry_protocol::operator::{ActionKind, ActionRequest, RecordKind};
use quarry_protocol::{Dimension, GamePacket, NamedEnum, Parameter, TaskDescriptor};
use quarry_query::{AccountId, AccountLink, Scheduler, SchedulerSettings, SchedulerStats};

use crate::engine::{TaskEngine, TaskEvent, TaskInfo};
use crate::registry::TaskRegistry;
use crate::sink::RecordSink;
use crate::task::{ChunkObservation, TaskContext, TaskId, TaskSettings, unix_millis};

/// Work handed to the tick thread.
pub enum Command {
    /// A game packet an account connection received.
    Packet {
        account: AccountId,
        packet: GamePacket,
    },
    AddAccount {
        id: AccountId,
        name: String,
        dimension: Dimension,
        link: Box<dyn AccountLink>,
    },
    RemoveAccount {
        id: AccountId,
    },
    StartTask {
        action_id: i64,
        name: String,
        params: Vec<Parameter>,
    },
    StopTask {
        action_id: i64,
        task_id: TaskId,
    },
    GetConfig {
        action_id: i64,
        name: String,
    },
    SetConfig {
        action_id: i64,
        name: String,
        value: RuleValue,
    },
    Action(ActionRequest),
    /// Reply with the state an operator session needs to sync.
    Snapshot(Sender<Snapshot>),
    /// Route events to a new operator session, replacing any previous one.
    Attach(Sender<RuntimeEvent>),
    Detach,
    Shutdown,
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::Packet { .. } => "packet",
            Command::AddAccount { .. } => "add_account",
            Command::RemoveAccount { .. } => "remove_account",
            Command::StartTask { .. } => "start_task",
            Command::StopTask { .. } => "stop_task",
            Command::GetConfig { .. } => "get_config",
            Command::SetConfig { .. } => "set_config",
            Command::Action(_) => "action",
            Command::Snapshot(_) => "snapshot",
            Command::Attach(_) => "attach",
            Command::Detach => "detach",
            Command::Shutdown => "shutdown",
        }
    }
}

/// An account as an operator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    pub name: String,
    pub uuid: u128,
    pub dimension: Dimension,
}

/// Things an attached operator session is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Task(TaskEvent),
    Stats {
        stats: SchedulerStats,
        accounts_online: usize,
    },
    Chat {
        account: String,
        message: String,
        timestamp: i64,
    },
    ChunkStates(Vec<ChunkObservation>),
    OnlinePlayers {
        added: Vec<(u128, String)>,
        removed: Vec<u128>,
    },
    AccountJoined(AccountInfo),
    AccountLeft {
        name: String,
    },
    /// Answer to a command carrying an action id.
    ActionResult {
        action_id: i64,
        success: bool,
        message: String,
    },
    /// A rule's value, either answering a get (`action_id` set) or pushed
    /// after a change.
    ConfigValue {
        action_id: Option<i64>,
        name: String,
        value: RuleValue,
    },
}

/// One config rule and its current value.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSnapshot {
    pub name: String,
    pub data_type: ConfigDataType,
    pub gettable: bool,
    pub settable: bool,
    pub value: RuleValue,
}

/// Everything an operator session announces right after it is accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub rules: Vec<RuleSnapshot>,
    pub registered: Vec<TaskDescriptor>,
    pub tasks: Vec<TaskInfo>,
    pub accounts: Vec<AccountInfo>,
    pub online_players: Vec<(u128, String)>,
}

/// Cloneable sender side of a [`Runtime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: Sender<Command>,
    next_account: Arc<AtomicU32>,
}

impl RuntimeHandle {
    /// Queue a command. Returns `false` once the runtime is gone.
    pub fn submit(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Allocate an id and register an account with the pool.
    pub fn register_account(
        &self,
        name: impl Into<String>,
        dimension: Dimension,
        link: Box<dyn AccountLink>,
    ) -> Option<AccountId> {
        let id = AccountId(self.next_account.fetch_add(1, Ordering::Relaxed));
        self.submit(Command::AddAccount {
            id,
            name: name.into(),
            dimension,
            link,
        })
        .then_some(id)
    }

    pub fn forward(&self, account: AccountId, packet: GamePacket) -> bool {
        self.submit(Command::Packet { account, packet })
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Single-threaded owner of all scheduling state.
pub struct Runtime {
    config: Config,
    rules: RuleTable,
    registry: TaskRegistry,
    scheduler: Scheduler,
    engine: TaskEngine,
    sink: Arc<dyn RecordSink>,
    commands: Receiver<Command>,
    observer: Option<Sender<RuntimeEvent>>,
    online: BTreeMap<u128, String>,
    online_added: Vec<(u128, String)>,
    online_removed: Vec<u128>,
    observations: Vec<ChunkObservation>,
    last_info: Option<Instant>,
    running: bool,
}

impl Runtime {
    pub fn new(
        config: Config,
        registry: TaskRegistry,
        sink: Arc<dyn RecordSink>,
    ) -> (Self, RuntimeHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Scheduler::new(SchedulerSettings::from_config(&config));
        let runtime = Self {
            config,
            rules: RuleTable::standard(),
            registry,
            scheduler,
            engine: TaskEngine::new(),
            sink,
            commands: rx,
            observer: None,
            online: BTreeMap::new(),
            online_added: Vec::new(),
            online_removed: Vec::new(),
            observations: Vec::new(),
            last_info: None,
            running: true,
        };
        let handle = RuntimeHandle {
            commands: tx,
            next_account: Arc::new(AtomicU32::new(1)),
        };
        (runtime, handle)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Run on a dedicated thread until shut down.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tick".into())
            .spawn(move || self.run())
    }

    /// Process commands as they arrive and cycle at the configured interval.
    pub fn run(mut self) {
        tracing::info!("runtime started");
        let mut next_cycle = Instant::now();
        while self.running {
            let timeout = next_cycle.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(timeout) {
                Ok(command) => self.handle_command(command, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            if self.running && now >= next_cycle {
                self.cycle(now);
                let interval = Duration::from_millis(self.config.scheduler.tick_interval_ms.max(1));
                next_cycle = now + interval;
            }
        }
        self.shutdown(Instant::now());
    }

    /// Handle every queued command without waiting. Returns how many ran.
    pub fn drain(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while self.running {
            match self.commands.try_recv() {
                Ok(command) => {
                    self.handle_command(command, now);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// One scheduling step: tick tasks, cycle queries, publish what changed.
    pub fn cycle(&mut self, now: Instant) {
        {
            let mut ctx = TaskContext {
                scheduler: &mut self.scheduler,
                observations: &mut self.observations,
                now,
            };
            self.engine.tick(&mut ctx);
        }
        self.scheduler.cycle(now);
        self.publish(now);
    }

    /// Finish every task, drop every query and flush the last events.
    pub fn shutdown(&mut self, now: Instant) {
        self.running = false;
        let tasks = self.engine.len();
        self.engine.finish_all();
        self.scheduler.cancel_all();
        self.scheduler.cycle(now);
        self.publish(now);
        tracing::info!(tasks, "runtime stopped");
    }

    pub fn handle_command(&mut self, command: Command, now: Instant) {
        tracing::trace!(command = command.kind(), "command");
        match command {
            Command::Packet { account, packet } => self.on_packet(account, packet),
            Command::AddAccount {
                id,
                name,
                dimension,
                link,
            } => {
                tracing::info!(account = %name, ?dimension, "account joined");
                self.scheduler.accounts_mut().add(id, name.clone(), dimension, link);
                let uuid = self.uuid_of(&name);
                self.emit(RuntimeEvent::AccountJoined(AccountInfo {
                    name,
                    uuid,
                    dimension,
                }));
            }
            Command::RemoveAccount { id } => self.remove_account(id),
            Command::StartTask {
                action_id,
                name,
                params,
            } => {
                let settings = TaskSettings::from_config(&self.config);
                let result = self
                    .registry
                    .create(&name, &params, &settings)
                    .map(|task| self.engine.add_task(task, now));
                match result {
                    Ok(task_id) => {
                        self.respond(action_id, true, format!("Started {name} as task {task_id}."))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "task start rejected");
                        self.respond(action_id, false, e.to_string());
                    }
                }
                self.flush_task_events();
            }
            Command::StopTask { action_id, task_id } => {
                match self.engine.remove_task(task_id) {
                    Ok(()) => self.respond(action_id, true, format!("Stopped task {task_id}.")),
                    Err(e) => self.respond(action_id, false, e.to_string()),
                }
                self.flush_task_events();
            }
            Command::GetConfig { action_id, name } => {
                match self.rules.get(&self.config, &name) {
                    Ok(value) => self.emit(RuntimeEvent::ConfigValue {
                        action_id: Some(action_id),
                        name,
                        value,
                    }),
                    Err(e) => self.respond(action_id, false, e.to_string()),
                }
            }
            Command::SetConfig {
                action_id,
                name,
                value,
            } => match self.rules.set(&mut self.config, &name, value) {
                Ok(()) => {
                    self.respond(action_id, true, format!("Set {name}."));
                    if let Ok(value) = self.rules.get(&self.config, &name) {
                        self.emit(RuntimeEvent::ConfigValue {
                            action_id: None,
                            name,
                            value,
                        });
                    }
                }
                Err(e) => self.respond(action_id, false, e.to_string()),
            },
            Command::Action(request) => self.on_action(request),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
            Command::Attach(observer) => {
                if self.observer.is_some() {
                    tracing::info!("replacing attached operator session");
                }
                self.observer = Some(observer);
                self.engine.attach();
                self.online_added.clear();
                self.online_removed.clear();
            }
            Command::Detach => self.detach(),
            Command::Shutdown => self.running = false,
        }
    }

    fn on_packet(&mut self, account: AccountId, packet: GamePacket) {
        self.scheduler.dispatch(account, &packet);
        match packet {
            GamePacket::ChatMessage(ChatMessage { message }) => {
                let name = self
                    .scheduler
                    .accounts()
                    .name(account)
                    .unwrap_or("unknown")
                    .to_owned();
                let timestamp = unix_millis();
                self.sink
                    .store(RecordKind::Chat, timestamp, format!("{name}: {message}"));
                self.emit(RuntimeEvent::Chat {
                    account: name,
                    message,
                    timestamp,
                });
            }
            GamePacket::PlayerListItem(item) => match item.action {
                PlayerListAction::Add => {
                    if self.online.insert(item.uuid, item.name.clone()).is_none() {
                        self.sink.store(
                            RecordKind::OnlinePlayer,
                            unix_millis(),
                            format!("+{:032x} {}", item.uuid, item.name),
                        );
                        self.online_added.push((item.uuid, item.name));
                    }
                }
                PlayerListAction::Remove => {
                    if let Some(name) = self.online.remove(&item.uuid) {
                        self.sink.store(
                            RecordKind::OnlinePlayer,
                            unix_millis(),
                            format!("-{:032x} {name}", item.uuid),
                        );
                        self.online_removed.push(item.uuid);
                    }
                }
            },
            _ => {}
        }
    }

    fn on_action(&mut self, request: ActionRequest) {
        let accounts = self.scheduler.accounts();
        let target = accounts.find(&request.target);
        match (request.action, target) {
            (ActionKind::SendChatMessage, Some(id)) => {
                let sent = accounts.send(
                    id,
                    ChatMessage {
                        message: request.argument.clone(),
                    },
                );
                match sent {
                    Ok(()) => self.respond(request.action_id, true, "Message sent.".into()),
                    Err(e) => self.respond(request.action_id, false, e.to_string()),
                }
            }
            (ActionKind::ToggleLogin, Some(id)) => {
                accounts.disconnect(id, "Logged out by operator.");
                self.remove_account(id);
                self.respond(
                    request.action_id,
                    true,
                    format!("Logged out {}.", request.target),
                );
            }
            (ActionKind::SendChatMessage | ActionKind::ToggleLogin, None) => self.respond(
                request.action_id,
                false,
                format!("{} is not logged in.", request.target),
            ),
            (ActionKind::UntrackPlayer, _) => self.respond(
                request.action_id,
                false,
                format!("No tracker follows {}.", request.target),
            ),
        }
    }

    fn remove_account(&mut self, id: AccountId) {
        let Some(name) = self.scheduler.accounts().name(id).map(str::to_owned) else {
            return;
        };
        self.scheduler.remove_account(id);
        tracing::info!(account = %name, "account left");
        self.emit(RuntimeEvent::AccountLeft { name });
    }

    fn uuid_of(&self, name: &str) -> u128 {
        self.online
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map_or(0, |(uuid, _)| *uuid)
    }

    fn snapshot(&self, now: Instant) -> Snapshot {
        let accounts = self.scheduler.accounts();
        Snapshot {
            rules: self
                .rules
                .describe()
                .map(|rule| RuleSnapshot {
                    name: rule.name().to_owned(),
                    data_type: rule.data_type(),
                    gettable: rule.gettable(),
                    settable: rule.settable(),
                    value: rule.read(&self.config),
                })
                .collect(),
            registered: self.registry.descriptors().cloned().collect(),
            tasks: self.engine.infos(now),
            accounts: accounts
                .iter()
                .map(|(id, name)| AccountInfo {
                    name: name.to_owned(),
                    uuid: self.uuid_of(name),
                    dimension: accounts.dimension(id).unwrap_or(Dimension::Overworld),
                })
                .collect(),
            online_players: self
                .online
                .iter()
                .map(|(uuid, name)| (*uuid, name.clone()))
                .collect(),
        }
    }

    fn publish(&mut self, now: Instant) {
        self.flush_task_events();

        let observations = std::mem::take(&mut self.observations);
        if !observations.is_empty() {
            for obs in &observations {
                self.sink.store(
                    RecordKind::ChunkState,
                    obs.timestamp,
                    format!(
                        "{},{},{},{}",
                        obs.pos.x,
                        obs.pos.z,
                        obs.dimension.as_name(),
                        obs.loaded
                    ),
                );
            }
            self.emit(RuntimeEvent::ChunkStates(observations));
        }

        if !self.online_added.is_empty() || !self.online_removed.is_empty() {
            let added = std::mem::take(&mut self.online_added);
            let removed = std::mem::take(&mut self.online_removed);
            self.emit(RuntimeEvent::OnlinePlayers { added, removed });
        }

        let interval = Duration::from_millis(self.config.scheduler.info_interval_ms);
        let due = self
            .last_info
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if due {
            self.last_info = Some(now);
            let stats = self.scheduler.stats(now);
            let accounts_online = self.scheduler.accounts().online();
            self.emit(RuntimeEvent::Stats {
                stats,
                accounts_online,
            });
        }
    }

    fn flush_task_events(&mut self) {
        for event in self.engine.drain_events() {
            self.emit(RuntimeEvent::Task(event));
        }
    }

    fn respond(&mut self, action_id: i64, success: bool, message: String) {
        self.emit(RuntimeEvent::ActionResult {
            action_id,
            success,
            message,
        });
    }

    fn emit(&mut self, event: RuntimeEvent) {
        let Some(observer) = &self.observer else {
            return;
        };
        if observer.send(event).is_err() {
            tracing::info!("operator session gone, detaching");
            self.detach();
        }
    }

    fn detach(&mut self) {
        self.observer = None;
        self.engine.detach();
        self.online_added.clear();
        self.online_removed.clear();
    }
}
