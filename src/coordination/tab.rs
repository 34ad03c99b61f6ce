use crate::channel::{ChannelEvent, ChannelMessage, Envelope, TabChannel, TabInbox};
use crate::clock::Clock;
use crate::coordination::election::{ElectionContext, ElectionTiming, RoleChange};
use crate::coordination::types::{validate_price_grouping, CoordinatorConfig, TabId, TabRole};
use crate::error::AppError;
use crate::market::bridge::{spawn_bridge, BridgeContext, BridgeHandle};
use crate::state::TabState;
use crate::store::{SharedStore, StoreKeys};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum TabCommand {
    Visible,
}

pub struct TabHandle {
    id: TabId,
    state: TabState,
    channel: Arc<dyn TabChannel>,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedSender<TabCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TabHandle {
    pub fn id(&self) -> &TabId {
        &self.id
    }

    pub fn state(&self) -> &TabState {
        &self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn notify_visible(&self) {
        if self.commands.send(TabCommand::Visible).is_err() {
            debug!(tab_id = %self.id, "visibility notice after tab stopped");
        }
    }

    pub fn set_price_grouping(&self, price_grouping: f64) -> Result<(), AppError> {
        let price_grouping = validate_price_grouping(price_grouping)?;
        self.state
            .update(|state| state.price_grouping = price_grouping);
        self.channel.post(Envelope {
            sender: self.id.clone(),
            message: ChannelMessage {
                event: ChannelEvent::PriceGrouping(price_grouping),
                timestamp: self.clock.now_ms(),
            },
        })
    }

    /// Clean exit: a leader stops its upstream, clears the leadership record
    /// and announces the resignation.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            warn!(tab_id = %self.id, %error, "tab task ended abnormally");
        }
    }

    /// Stops the tab without any cleanup, leaving its heartbeat and any
    /// leadership record behind.
    pub fn abort(self) {
        self.task.abort();
    }
}

pub fn spawn_tab<S: SharedStore>(
    id: TabId,
    config: Arc<CoordinatorConfig>,
    store: Arc<S>,
    channel: Arc<dyn TabChannel>,
    clock: Arc<dyn Clock>,
) -> TabHandle {
    let state = TabState::new(config.price_grouping);
    let cancel = CancellationToken::new();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let inbox = TabInbox::new(id.clone(), channel.as_ref());
    let changes = store.changes();
    let election = ElectionContext::new(
        id.clone(),
        store,
        StoreKeys::new(&config.namespace),
        ElectionTiming::from(&*config),
        Arc::clone(&clock),
    );
    let runtime = TabRuntime {
        election,
        config,
        state: state.clone(),
        channel: Arc::clone(&channel),
        clock: Arc::clone(&clock),
        bridge: None,
        observed_leader: None,
    };
    let task = tokio::spawn(runtime.run(cancel.clone(), commands_rx, inbox, changes));

    TabHandle {
        id,
        state,
        channel,
        clock,
        commands: commands_tx,
        cancel,
        task,
    }
}

struct TabRuntime<S> {
    election: ElectionContext<S>,
    config: Arc<CoordinatorConfig>,
    state: TabState,
    channel: Arc<dyn TabChannel>,
    clock: Arc<dyn Clock>,
    bridge: Option<BridgeHandle>,
    observed_leader: Option<TabId>,
}

impl<S: SharedStore> TabRuntime<S> {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::UnboundedReceiver<TabCommand>,
        mut inbox: TabInbox,
        mut changes: Option<broadcast::Receiver<String>>,
    ) {
        let tab_id = self.election.id().clone();
        info!(%tab_id, namespace = %self.config.namespace, "tab joined");

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.startup_delay,
            self.config.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recheck: Option<Instant> = None;
        let mut commands_open = true;
        let mut inbox_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    recheck = self.cycle(&cancel).await;
                }
                _ = sleep_until_deadline(recheck) => {
                    recheck = self.cycle(&cancel).await;
                }
                command = commands.recv(), if commands_open => match command {
                    Some(TabCommand::Visible) => {
                        debug!(%tab_id, "visible again, checking leadership");
                        recheck = self.cycle(&cancel).await;
                    }
                    None => commands_open = false,
                },
                envelope = inbox.recv(), if inbox_open => match envelope {
                    Some(envelope) => {
                        if let Some(deadline) = self.on_envelope(envelope, &cancel).await {
                            recheck = Some(deadline);
                        }
                    }
                    None => inbox_open = false,
                },
                changed = next_change(&mut changes) => match changed {
                    Some(key) => {
                        if let Some(deadline) = self.leader_changed(&key).await {
                            recheck = Some(deadline);
                        }
                    }
                    None => changes = None,
                },
            }
        }

        self.depart().await;
        info!(%tab_id, "tab left");
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Option<Instant> {
        let outcome = self.election.run_cycle(cancel).await;
        self.state.set_role(self.election.role());

        match outcome.change {
            Some(RoleChange::Promoted) => self.activate(),
            Some(RoleChange::Demoted) => self.deactivate().await,
            None => {}
        }
        self.state.set_known_leader(outcome.leader);

        outcome
            .recheck_after
            .map(|delay| Instant::now() + delay)
    }

    fn activate(&mut self) {
        let tab_id = self.election.id().clone();
        if self.bridge.is_none() {
            let context = BridgeContext::new(
                tab_id.clone(),
                Arc::clone(&self.config),
                self.state.clone(),
                Arc::clone(&self.channel),
                Arc::clone(&self.clock),
            );
            self.bridge = Some(spawn_bridge(context));
        }
        self.post(ChannelEvent::LeadershipChanged { leader_id: tab_id });
    }

    async fn deactivate(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.stop().await;
        }
    }

    async fn on_envelope(
        &mut self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Option<Instant> {
        let event = envelope.message.event;
        self.state.apply_remote_event(&event, self.clock.now_ms());

        match event {
            ChannelEvent::LeaderResigned { leader_id } => {
                debug!(tab_id = %self.election.id(), resigned = %leader_id, "leader resigned");
                Some(Instant::now() + self.config.election_delay)
            }
            ChannelEvent::LeadershipChanged { leader_id } if &leader_id != self.election.id() => {
                self.cycle(cancel).await
            }
            _ => None,
        }
    }

    /// A new leader id is checked right away. A cleared record waits one
    /// election delay, like a resignation notice.
    async fn leader_changed(&mut self, key: &str) -> Option<Instant> {
        if key != self.election.keys().leader_id() {
            return None;
        }
        let current = self.election.read_leadership().await.leader_id;
        if current == self.observed_leader {
            return None;
        }
        let cleared = current.is_none();
        self.observed_leader = current;
        if cleared {
            Some(Instant::now() + self.config.election_delay)
        } else {
            Some(Instant::now())
        }
    }

    async fn depart(&mut self) {
        self.deactivate().await;
        if self.election.depart().await {
            let leader_id = self.election.id().clone();
            self.post(ChannelEvent::LeaderResigned { leader_id });
        }
        self.state.set_role(TabRole::Follower);
    }

    fn post(&self, event: ChannelEvent) {
        let envelope = Envelope {
            sender: self.election.id().clone(),
            message: ChannelMessage {
                event,
                timestamp: self.clock.now_ms(),
            },
        };
        if let Err(error) = self.channel.post(envelope) {
            warn!(tab_id = %self.election.id(), %error, "failed to post coordination notice");
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_change(changes: &mut Option<broadcast::Receiver<String>>) -> Option<String> {
    let Some(receiver) = changes else {
        return pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(key) => return Some(key),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}
