// 定期的な計測要求
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::channel::{ChannelError, CommandChannel, RequestKind};
use crate::echonetlite::smart_electric_energy_meter as SM;
use crate::reading::{MetricKind, ReadingParser};
use crate::session::SessionManager;
use crate::transport::Transport;
use std::time::{Duration, Instant};

/// 計測ごとのタイマー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimer {
    pub interval: Duration,
    pub last_fire: Instant,
}

impl PollTimer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_fire: now,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    // 遅れた分は取り戻さない
    fn fire(&mut self, now: Instant) {
        self.last_fire = now;
    }
}

/// 瞬時電力と積算電力量を別々の間隔で要求する
#[derive(Debug)]
pub struct PollScheduler {
    power: Option<PollTimer>,
    energy: Option<PollTimer>,
    last_parameters_request: Option<Instant>,
}

impl PollScheduler {
    /// 係数と単位の要求間隔
    pub const PARAMETERS_RETRY: Duration = Duration::from_secs(5);

    pub fn new(power: Option<Duration>, energy: Option<Duration>, now: Instant) -> Self {
        Self {
            power: power.map(|interval| PollTimer::new(interval, now)),
            energy: energy.map(|interval| PollTimer::new(interval, now)),
            last_parameters_request: None,
        }
    }

    /// 計測するものがあるか
    pub fn is_measuring(&self) -> bool {
        self.power.is_some() || self.energy.is_some()
    }

    pub fn timer(&self, kind: MetricKind) -> Option<&PollTimer> {
        match kind {
            MetricKind::Power => self.power.as_ref(),
            MetricKind::Energy => self.energy.as_ref(),
        }
    }

    /// 期限の来た計測を1つだけ要求する
    pub fn tick<T: Transport>(
        &mut self,
        now: Instant,
        session: &SessionManager,
        channel: &mut CommandChannel<T>,
        parser: &ReadingParser,
    ) -> Result<Option<RequestKind>, ChannelError> {
        let Some(destination) = session.destination() else {
            return Ok(None);
        };
        if channel.is_busy() {
            return Ok(None);
        }
        if let Some(timer) = self.power.as_mut().filter(|t| t.is_due(now)) {
            timer.fire(now);
            let kind = RequestKind::Metric(MetricKind::Power);
            channel.send_get(kind, destination, &[MetricKind::Power.epc()], now)?;
            return Ok(Some(kind));
        }
        if !self.energy.is_some_and(|t| t.is_due(now)) {
            return Ok(None);
        }
        if parser.energy_scale().is_none() {
            // 係数と単位が分かるまで積算電力量のタイマーは進めない
            let waiting = self
                .last_parameters_request
                .is_some_and(|t| now.saturating_duration_since(t) < Self::PARAMETERS_RETRY);
            if waiting {
                return Ok(None);
            }
            self.last_parameters_request = Some(now);
            let kind = RequestKind::EnergyParameters;
            let epcs = [SM::Coefficient::EPC, SM::UnitForCumlativeAmountsPower::EPC];
            channel.send_get(kind, destination, &epcs, now)?;
            return Ok(Some(kind));
        }
        if let Some(timer) = self.energy.as_mut() {
            timer.fire(now);
        }
        let kind = RequestKind::Metric(MetricKind::Energy);
        channel.send_get(kind, destination, &[MetricKind::Energy.epc()], now)?;
        Ok(Some(kind))
    }
}

#[test]
fn test_poll_timer() {
    let t0 = Instant::now();
    let mut timer = PollTimer::new(Duration::from_secs(30), t0);
    assert!(!timer.is_due(t0 + Duration::from_secs(29)));
    assert!(timer.is_due(t0 + Duration::from_secs(30)));
    // 遅れても1回だけ
    timer.fire(t0 + Duration::from_secs(95));
    assert!(!timer.is_due(t0 + Duration::from_secs(120)));
    assert!(timer.is_due(t0 + Duration::from_secs(125)));
}

#[test]
fn test_is_measuring() {
    let t0 = Instant::now();
    assert!(!PollScheduler::new(None, None, t0).is_measuring());
    let scheduler = PollScheduler::new(None, Some(Duration::from_secs(60)), t0);
    assert!(scheduler.is_measuring());
    assert!(scheduler.timer(MetricKind::Power).is_none());
    assert_eq!(
        scheduler.timer(MetricKind::Energy).map(|t| t.interval),
        Some(Duration::from_secs(60))
    );
}
