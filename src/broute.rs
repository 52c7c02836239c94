// ルートBでスマートメーターから計測値を集める
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::channel::{CommandChannel, Delivery, Outcome, RequestKind, Response};
use crate::fault::{FailureKind, FaultMonitor, FaultThresholds};
use crate::reading::{MetricKind, Reading, ReadingParser};
use crate::scheduler::PollScheduler;
use crate::session::{SessionManager, SessionState};
use crate::settings::BRouteSettings;
use crate::skstack::{Erxudp, SkRxD};
use crate::transport::Transport;
use std::time::Instant;

/// 計測値の受け取り手
pub trait Publish {
    fn publish(&mut self, reading: &Reading);
}

/// スマートメーター1台分
///
/// 状態はすべてこの中にあるので、複数台を同じプロセスで動かせる。
pub struct BRoute<T: Transport, P: Publish> {
    settings: BRouteSettings,
    channel: CommandChannel<T>,
    session: SessionManager,
    scheduler: PollScheduler,
    parser: ReadingParser,
    fault: FaultMonitor,
    publisher: P,
}

impl<T: Transport, P: Publish> BRoute<T, P> {
    pub fn new(settings: BRouteSettings, transport: T, publisher: P, now: Instant) -> Self {
        let scheduler = PollScheduler::new(settings.power_interval, settings.energy_interval, now);
        let fault = FaultMonitor::new(FaultThresholds::from(&settings), now);
        Self {
            settings,
            channel: CommandChannel::new(transport),
            session: SessionManager::new(),
            scheduler,
            parser: ReadingParser::new(),
            fault,
            publisher,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn fault(&self) -> &FaultMonitor {
        &self.fault
    }

    pub fn parser(&self) -> &ReadingParser {
        &self.parser
    }

    /// ログインを始める
    pub fn setup(&mut self, now: Instant) {
        if !self.scheduler.is_measuring() {
            tracing::warn!("neither power nor energy is configured");
        }
        self.session.begin(self.settings.credentials.clone());
        self.session.poll(&mut self.channel, &mut self.fault, now);
    }

    /// 定期的に呼び出す
    pub fn tick(&mut self, now: Instant) {
        for delivery in self.channel.poll(now) {
            self.dispatch(delivery, now);
        }
        if self.scheduler.is_measuring() {
            if let Some(action) = self.fault.evaluate(now) {
                self.session.apply(action, &mut self.channel, now);
            }
        }
        self.session.poll(&mut self.channel, &mut self.fault, now);
        match self
            .scheduler
            .tick(now, &self.session, &mut self.channel, &self.parser)
        {
            Ok(Some(kind)) => tracing::debug!("{} requested", kind),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("{}", e);
                self.poll_failed(FailureKind::Transport, now);
            }
        }
    }

    fn poll_failed(&mut self, kind: FailureKind, now: Instant) {
        self.fault.on_failure(kind, now);
        self.session.on_poll_failure(&self.fault);
    }

    fn dispatch(&mut self, delivery: Delivery, now: Instant) {
        match delivery {
            Delivery::Completed {
                kind: RequestKind::Login(step),
                outcome,
            } => self.session.on_outcome(step, outcome, &mut self.fault, now),
            Delivery::Completed {
                kind: RequestKind::Metric(metric),
                outcome,
            } => self.on_metric(metric, outcome, now),
            Delivery::Completed {
                kind: RequestKind::EnergyParameters,
                outcome,
            } => self.on_energy_parameters(outcome, now),
            Delivery::Unsolicited(SkRxD::Event(event)) => {
                self.session.on_event(&event, &mut self.fault, now)
            }
            Delivery::Unsolicited(SkRxD::Erxudp(erxudp))
                if erxudp.destination_port == Erxudp::ECHONETLITE_PORT =>
            {
                match self.parser.describe(&erxudp.data) {
                    Ok(text) => tracing::info!("{}", text),
                    Err(e) => tracing::debug!("{}", e),
                }
                // 接続中のメーターからの定時積算電力量は疎通の証拠
                if self.session.destination() == Some(erxudp.sender)
                    && self.parser.fixed_time_notification(&erxudp.data).is_ok()
                {
                    self.fault.on_success(now);
                }
            }
            Delivery::Unsolicited(rxd) => tracing::trace!("{:?}", rxd),
            Delivery::TransportFault(reason) => {
                tracing::warn!("{}", reason);
                self.poll_failed(FailureKind::Transport, now);
            }
        }
    }

    fn on_metric(&mut self, metric: MetricKind, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Response(Response::Udp(payload)) => {
                match self.parser.parse(&payload, metric, now) {
                    Ok(reading) => {
                        self.fault.on_success(now);
                        tracing::info!("{}", reading);
                        self.publisher.publish(&reading);
                    }
                    Err(e) => {
                        tracing::warn!("{}: {}", metric, e);
                        self.poll_failed(FailureKind::ParseError, now);
                    }
                }
            }
            Outcome::Timeout => self.poll_failed(FailureKind::Timeout, now),
            Outcome::MalformedReply(reason) => {
                tracing::warn!("{}: {}", metric, reason);
                self.poll_failed(FailureKind::MalformedReply, now);
            }
            Outcome::Response(response) => {
                tracing::warn!("{}: unexpected response {:?}", metric, response);
                self.poll_failed(FailureKind::MalformedReply, now);
            }
        }
    }

    fn on_energy_parameters(&mut self, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Response(Response::Udp(payload)) => {
                match self.parser.absorb_energy_parameters(&payload) {
                    Ok(()) => {
                        self.fault.on_success(now);
                        if let Some(scale) = self.parser.energy_scale() {
                            tracing::info!("{} {}", scale.coefficient, scale.unit);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("energy parameters: {}", e);
                        self.poll_failed(FailureKind::ParseError, now);
                    }
                }
            }
            Outcome::Timeout => self.poll_failed(FailureKind::Timeout, now),
            Outcome::MalformedReply(reason) => {
                tracing::warn!("energy parameters: {}", reason);
                self.poll_failed(FailureKind::MalformedReply, now);
            }
            Outcome::Response(response) => {
                tracing::warn!("energy parameters: unexpected response {:?}", response);
                self.poll_failed(FailureKind::MalformedReply, now);
            }
        }
    }
}
