// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection state machine.
//!
//! Pure transition logic for the live feed: every input returns the
//! effects the driver must carry out, in order. No I/O happens here.

use std::time::Duration;

use log::{debug, error, info, warn};

use super::{Command, ConnectionState, FeedEvent};
use crate::backoff::BackoffPolicy;
use crate::ledger::{AreaKey, Subscription, SubscriptionLedger, MAX_AREA_CELLS};
use crate::protocol::{ControlFrame, InboundFrame, JsonFrameParser, SubscriptionAction};

/// Close code for an intentional, clean close.
pub const CLEAN_CLOSE_CODE: u16 = 1000;

/// Close code used when the transport fails without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start opening the transport.
    Open,
    /// Send a control frame on the open transport.
    Send(ControlFrame),
    /// Close the transport cleanly and abandon any pending open.
    Close,
    /// Fire `on_reconnect_timer` after the delay.
    ScheduleReconnect(Duration),
    /// Fire `on_replay_timer` after the delay.
    ScheduleReplay(Duration),
    /// Drop any scheduled timers.
    CancelTimers,
    /// Publish an event to subscribers.
    Emit(FeedEvent),
}

/// Live feed connection state machine.
#[derive(Debug)]
pub struct FeedMachine {
    state: ConnectionState,
    attempts: u32,
    /// Set once the ledger has been replayed on the current connection.
    replayed: bool,
    ledger: SubscriptionLedger,
    policy: BackoffPolicy,
    settle_delay: Duration,
    parser: JsonFrameParser,
    last_error: Option<String>,
    effects: Vec<Effect>,
}

impl FeedMachine {
    #[must_use]
    pub fn new(policy: BackoffPolicy, settle_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            replayed: false,
            ledger: SubscriptionLedger::new(),
            policy,
            settle_delay,
            parser: JsonFrameParser::new(),
            last_error: None,
            effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Dispatch a caller command.
    pub fn handle(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Subscribe(id) => self.subscribe(&id),
            Command::Unsubscribe(id) => self.unsubscribe(&id),
            Command::SubscribeArea(area) => self.subscribe_area(area),
            Command::UnsubscribeArea(area) => self.unsubscribe_area(area),
            Command::SyncAreas(areas) => self.sync_areas(areas),
            Command::Stop => self.stop(),
        }
    }

    /// Start the feed. A no-op while connecting, connected or waiting to reconnect.
    pub fn connect(&mut self) -> Vec<Effect> {
        self.ensure_started();
        self.take()
    }

    /// Close cleanly. Never schedules a reconnect and leaves the ledger intact.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.close_cleanly();
        self.take()
    }

    pub fn subscribe(&mut self, id: &str) -> Vec<Effect> {
        let id = id.trim();
        if id.is_empty() {
            warn!("Ignoring subscription to an empty entity id");
            return self.take();
        }
        if self.ledger.add_entity(id) {
            self.added(Subscription::Entity(id.to_owned()));
        }
        self.ensure_started();
        self.take()
    }

    pub fn unsubscribe(&mut self, id: &str) -> Vec<Effect> {
        let id = id.trim();
        if self.ledger.remove_entity(id) {
            self.removed(Subscription::Entity(id.to_owned()));
        }
        self.take()
    }

    pub fn subscribe_area(&mut self, area: AreaKey) -> Vec<Effect> {
        if self.ledger.add_area(area) {
            self.added(Subscription::Area(area));
        }
        self.ensure_started();
        self.take()
    }

    pub fn unsubscribe_area(&mut self, area: AreaKey) -> Vec<Effect> {
        if self.ledger.remove_area(area) {
            self.removed(Subscription::Area(area));
        }
        self.take()
    }

    /// Make the area set match `areas`, sending only the difference.
    pub fn sync_areas(&mut self, areas: Vec<AreaKey>) -> Vec<Effect> {
        if areas.len() > MAX_AREA_CELLS {
            warn!(
                "Ignoring area sync of {} cells (limit {MAX_AREA_CELLS}); zoom in to follow live traffic",
                areas.len()
            );
            return self.take();
        }
        let diff = self.ledger.sync_areas(areas);
        for area in &diff.removed {
            self.removed(Subscription::Area(*area));
        }
        for area in &diff.added {
            self.added(Subscription::Area(*area));
        }
        if !diff.added.is_empty() {
            self.ensure_started();
        }
        self.take()
    }

    /// Leave area mode; disconnect if no entity subscriptions remain.
    pub fn stop(&mut self) -> Vec<Effect> {
        for area in self.ledger.clear_areas() {
            self.removed(Subscription::Area(area));
        }
        if self.ledger.has_entities() {
            debug!("Live feed kept open for {} entity subscriptions", self.ledger.len());
        } else {
            self.close_cleanly();
        }
        self.take()
    }

    /// The transport finished opening.
    pub fn on_open(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            warn!("Transport opened in state {:?}; closing it", self.state);
            self.effects.push(Effect::Close);
            return self.take();
        }
        info!("Live feed connected");
        self.attempts = 0;
        self.replayed = false;
        self.last_error = None;
        self.set_state(ConnectionState::Connected);
        self.emit(FeedEvent::ConnectionOpened);
        self.effects.push(Effect::ScheduleReplay(self.settle_delay));
        self.take()
    }

    /// The settle delay after opening elapsed: replay the whole ledger.
    pub fn on_replay_timer(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connected || self.replayed {
            return self.take();
        }
        self.replayed = true;
        let entries = self.ledger.replay();
        info!("Replaying {} subscriptions", entries.len());
        for subscription in &entries {
            self.effects
                .push(Effect::Send(ControlFrame::subscribe(subscription)));
        }
        self.take()
    }

    /// The transport closed, or failed to open.
    pub fn on_closed(&mut self, code: u16, reason: &str) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Abandoned => {
                debug!("Ignoring close ({code}) in state {:?}", self.state);
                return self.take();
            }
        }

        if self.state == ConnectionState::Connected {
            self.emit(FeedEvent::ConnectionClosed {
                code,
                reason: reason.to_owned(),
            });
        }
        self.replayed = false;

        if code == CLEAN_CLOSE_CODE {
            info!("Live feed closed cleanly");
            self.attempts = 0;
            self.set_state(ConnectionState::Disconnected);
        } else {
            warn!("Live feed closed unexpectedly ({code}): {reason}");
            self.schedule_reconnect();
        }
        self.take()
    }

    /// A transport error. Informational; closure is reported separately.
    pub fn on_error(&mut self, message: &str) -> Vec<Effect> {
        error!("Live feed error: {message}");
        self.last_error = Some(message.to_owned());
        self.emit(FeedEvent::ConnectionError(message.to_owned()));
        self.take()
    }

    /// The backoff delay elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Reconnecting {
            info!(
                "Reconnect attempt {} of {}",
                self.attempts, self.policy.max_attempts
            );
            self.begin_connect();
        }
        self.take()
    }

    /// An inbound text frame. Malformed frames are dropped.
    pub fn on_frame(&mut self, text: &str) -> Vec<Effect> {
        match self.parser.parse_text(text) {
            Ok(Some(InboundFrame::Fix(fix))) => self.emit(FeedEvent::FixReceived(fix)),
            Ok(Some(InboundFrame::Description(desc))) => {
                self.emit(FeedEvent::EntityReceived(desc));
            }
            Ok(None) => debug!("Ignoring unhandled frame"),
            Err(e) => warn!("Dropping malformed frame: {e}"),
        }
        self.take()
    }

    fn ensure_started(&mut self) {
        match self.state {
            ConnectionState::Disconnected => self.begin_connect(),
            ConnectionState::Abandoned => {
                self.attempts = 0;
                self.begin_connect();
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {}
        }
    }

    fn begin_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        self.effects.push(Effect::Open);
    }

    fn close_cleanly(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let was_connected = self.state == ConnectionState::Connected;
        self.effects.push(Effect::CancelTimers);
        self.effects.push(Effect::Close);
        self.attempts = 0;
        self.replayed = false;
        if was_connected {
            self.emit(FeedEvent::ConnectionClosed {
                code: CLEAN_CLOSE_CODE,
                reason: "client disconnect".to_owned(),
            });
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_reconnect(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                warn!(
                    "Reconnecting in {} ms (attempt {} of {})",
                    delay.as_millis(),
                    self.attempts,
                    self.policy.max_attempts
                );
                self.set_state(ConnectionState::Reconnecting);
                self.emit(FeedEvent::Reconnecting {
                    attempt: self.attempts,
                    max_attempts: self.policy.max_attempts,
                    delay,
                });
                self.effects.push(Effect::ScheduleReconnect(delay));
            }
            None => {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.policy.max_attempts
                );
                self.set_state(ConnectionState::Abandoned);
                self.emit(FeedEvent::ReconnectAbandoned {
                    attempts: self.policy.max_attempts,
                });
            }
        }
    }

    fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected && self.replayed
    }

    fn added(&mut self, subscription: Subscription) {
        if self.is_live() {
            self.effects.push(Effect::Send(ControlFrame::new(
                SubscriptionAction::Subscribe,
                &subscription,
            )));
        }
        self.emit(FeedEvent::SubscriptionAdded(subscription));
    }

    fn removed(&mut self, subscription: Subscription) {
        if self.is_live() {
            self.effects.push(Effect::Send(ControlFrame::new(
                SubscriptionAction::Unsubscribe,
                &subscription,
            )));
        }
        self.emit(FeedEvent::SubscriptionRemoved(subscription));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(FeedEvent::StateChanged(state));
        }
    }

    fn emit(&mut self, event: FeedEvent) {
        self.effects.push(Effect::Emit(event));
    }

    fn take(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Bounds;
    use pretty_assertions::assert_eq;

    fn machine() -> FeedMachine {
        FeedMachine::new(
            BackoffPolicy::new(Duration::from_millis(100), 5),
            Duration::from_millis(50),
        )
    }

    fn sent(effects: &[Effect]) -> Vec<ControlFrame> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn device(action: SubscriptionAction, id: &str) -> ControlFrame {
        ControlFrame::Device {
            action,
            id: id.to_string(),
        }
    }

    /// Drive a fresh machine to Connected with the ledger replayed.
    fn connected() -> FeedMachine {
        let mut machine = machine();
        machine.connect();
        machine.on_open();
        machine.on_replay_timer();
        machine
    }

    #[test]
    fn test_connect_opens_once() {
        let mut machine = machine();
        let effects = machine.connect();
        assert!(effects.contains(&Effect::Open));
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let again = machine.connect();
        assert!(!again.contains(&Effect::Open));
    }

    #[test]
    fn test_subscribe_while_disconnected_queues_and_connects() {
        let mut machine = machine();
        let effects = machine.subscribe("A");
        assert!(sent(&effects).is_empty());
        assert!(effects.contains(&Effect::Open));
        assert!(effects.contains(&Effect::Emit(FeedEvent::SubscriptionAdded(
            Subscription::Entity("A".to_string())
        ))));
        assert!(machine.ledger().contains_entity("A"));
    }

    #[test]
    fn test_open_schedules_replay_after_settle_delay() {
        let mut machine = machine();
        machine.subscribe("A");
        let effects = machine.on_open();
        assert!(sent(&effects).is_empty());
        assert!(effects.contains(&Effect::ScheduleReplay(Duration::from_millis(50))));
        assert!(effects.contains(&Effect::Emit(FeedEvent::ConnectionOpened)));

        let replay = machine.on_replay_timer();
        assert_eq!(sent(&replay), vec![device(SubscriptionAction::Subscribe, "A")]);
    }

    #[test]
    fn test_subscribe_twice_sends_one_frame() {
        let mut machine = connected();
        let first = machine.subscribe("A");
        let second = machine.subscribe("A");
        assert_eq!(sent(&first), vec![device(SubscriptionAction::Subscribe, "A")]);
        assert!(sent(&second).is_empty());
    }

    #[test]
    fn test_subscribe_during_settle_window_waits_for_replay() {
        let mut machine = machine();
        machine.connect();
        machine.on_open();
        let during = machine.subscribe("A");
        assert!(sent(&during).is_empty());

        let replay = machine.on_replay_timer();
        assert_eq!(sent(&replay), vec![device(SubscriptionAction::Subscribe, "A")]);
        assert!(sent(&machine.on_replay_timer()).is_empty());
    }

    #[test]
    fn test_unsubscribe_sends_frame_when_live() {
        let mut machine = connected();
        machine.subscribe("A");
        let effects = machine.unsubscribe("A");
        assert_eq!(sent(&effects), vec![device(SubscriptionAction::Unsubscribe, "A")]);
        assert!(sent(&machine.unsubscribe("A")).is_empty());
    }

    #[test]
    fn test_reconnect_replays_full_ledger_once() {
        let mut machine = connected();
        machine.subscribe("A");
        machine.subscribe("B");

        let closed = machine.on_closed(ABNORMAL_CLOSE_CODE, "reset");
        assert!(closed.contains(&Effect::ScheduleReconnect(Duration::from_millis(100))));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert!(machine.ledger().contains_entity("A"));

        assert!(machine.on_reconnect_timer().contains(&Effect::Open));
        machine.on_open();
        let replay = machine.on_replay_timer();
        assert_eq!(
            sent(&replay),
            vec![
                device(SubscriptionAction::Subscribe, "A"),
                device(SubscriptionAction::Subscribe, "B"),
            ]
        );
    }

    #[test]
    fn test_backoff_sequence_and_abandon() {
        let mut machine = machine();
        machine.connect();

        let mut delays = Vec::new();
        for _ in 0..5 {
            let effects = machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
            for effect in &effects {
                if let Effect::ScheduleReconnect(delay) = effect {
                    delays.push(*delay);
                }
            }
            assert!(machine.on_reconnect_timer().contains(&Effect::Open));
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );

        let last = machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
        assert!(!last
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleReconnect(_))));
        assert!(last.contains(&Effect::Emit(FeedEvent::ReconnectAbandoned { attempts: 5 })));
        assert_eq!(machine.state(), ConnectionState::Abandoned);

        // Stray timer after giving up does nothing.
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_reconnecting_event_reports_attempts() {
        let mut machine = connected();
        let effects = machine.on_closed(4000, "server restart");
        assert!(effects.contains(&Effect::Emit(FeedEvent::Reconnecting {
            attempt: 1,
            max_attempts: 5,
            delay: Duration::from_millis(100),
        })));
        assert!(effects.contains(&Effect::Emit(FeedEvent::ConnectionClosed {
            code: 4000,
            reason: "server restart".to_string(),
        })));
    }

    #[test]
    fn test_connect_resumes_after_abandon() {
        let mut machine = machine();
        machine.connect();
        for _ in 0..5 {
            machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
            machine.on_reconnect_timer();
        }
        machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
        assert_eq!(machine.state(), ConnectionState::Abandoned);

        assert!(machine.connect().contains(&Effect::Open));
        assert_eq!(machine.attempts(), 0);
        machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
        assert_eq!(machine.attempts(), 1);
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut machine = machine();
        machine.connect();
        machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
        machine.on_reconnect_timer();
        machine.on_closed(ABNORMAL_CLOSE_CODE, "refused");
        assert_eq!(machine.attempts(), 2);
        machine.on_reconnect_timer();
        machine.on_open();
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_server_clean_close_does_not_reconnect() {
        let mut machine = connected();
        let effects = machine.on_closed(CLEAN_CLOSE_CODE, "bye");
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleReconnect(_))));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_never_reconnects() {
        let mut machine = connected();
        machine.subscribe("A");
        let effects = machine.disconnect();
        assert!(effects.contains(&Effect::Close));
        assert!(effects.contains(&Effect::CancelTimers));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.ledger().contains_entity("A"));

        // The socket's own close notification arrives afterwards.
        let late = machine.on_closed(CLEAN_CLOSE_CODE, "");
        assert!(late.is_empty());
        let late_unclean = machine.on_closed(ABNORMAL_CLOSE_CODE, "");
        assert!(late_unclean.is_empty());
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut machine = connected();
        assert!(!machine.disconnect().is_empty());
        assert!(machine.disconnect().is_empty());
    }

    #[test]
    fn test_disconnect_while_reconnecting_cancels_timer() {
        let mut machine = connected();
        machine.on_closed(ABNORMAL_CLOSE_CODE, "reset");
        let effects = machine.disconnect();
        assert!(effects.contains(&Effect::CancelTimers));
        assert!(machine.on_reconnect_timer().is_empty());
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_stale_open_is_closed() {
        let mut machine = machine();
        let effects = machine.on_open();
        assert_eq!(effects, vec![Effect::Close]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut machine = connected();
        assert!(machine.on_frame("{not json").is_empty());
        assert!(machine.on_frame(r#"{"type":"fix"}"#).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);

        let effects = machine.on_frame(
            r#"{"type":"fix","aircraftId":"A","timestamp":"2024-06-01T12:00:00Z","latitude":1.0,"longitude":2.0}"#,
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::Emit(FeedEvent::FixReceived(fix))] if fix.aircraft_id == "A"
        ));
    }

    #[test]
    fn test_error_is_reported_without_state_change() {
        let mut machine = connected();
        let effects = machine.on_error("broken pipe");
        assert_eq!(
            effects,
            vec![Effect::Emit(FeedEvent::ConnectionError("broken pipe".to_string()))]
        );
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.last_error(), Some("broken pipe"));
    }

    #[test]
    fn test_sync_areas_sends_difference() {
        let mut machine = connected();
        machine.sync_areas(vec![AreaKey::new(1, 1), AreaKey::new(2, 2)]);
        let effects = machine.sync_areas(vec![AreaKey::new(2, 2), AreaKey::new(3, 3)]);
        assert_eq!(
            sent(&effects),
            vec![
                ControlFrame::Area {
                    action: SubscriptionAction::Unsubscribe,
                    latitude: 1,
                    longitude: 1,
                },
                ControlFrame::Area {
                    action: SubscriptionAction::Subscribe,
                    latitude: 3,
                    longitude: 3,
                },
            ]
        );
    }

    #[test]
    fn test_oversized_area_sync_is_ignored() {
        let mut machine = connected();
        machine.sync_areas(vec![AreaKey::new(1, 1)]);
        let world = AreaKey::covering(&Bounds::new(90.0, -90.0, 180.0, -180.0));
        let effects = machine.sync_areas(world);
        assert!(effects.is_empty());
        assert!(machine.ledger().contains_area(AreaKey::new(1, 1)));
        assert_eq!(machine.ledger().len(), 1);
    }

    #[test]
    fn test_stop_keeps_entity_subscriptions_open() {
        let mut machine = connected();
        machine.subscribe("A");
        machine.subscribe_area(AreaKey::new(1, 1));
        let effects = machine.stop();
        assert_eq!(sent(&effects).len(), 1);
        assert_eq!(machine.state(), ConnectionState::Connected);

        machine.unsubscribe("A");
        let effects = machine.stop();
        assert!(effects.contains(&Effect::Close));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.ledger().is_empty());
    }

    #[test]
    fn test_handle_dispatches_commands() {
        let mut machine = machine();
        assert!(machine
            .handle(Command::SubscribeArea(AreaKey::new(5, 5)))
            .contains(&Effect::Open));
        assert!(machine.ledger().contains_area(AreaKey::new(5, 5)));
        machine.handle(Command::UnsubscribeArea(AreaKey::new(5, 5)));
        assert!(machine.ledger().is_empty());
    }
}
