// 障害の監視と復旧手順の決定
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::settings::BRouteSettings;
use std::fmt;
use std::time::{Duration, Instant};

/// 失敗の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    MalformedReply,
    ParseError,
    Transport,
    EmptyScan,
}

/// 復旧手順(後ろほど重い)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationAction {
    Rejoin,
    Rescan,
    Restart,
}

impl fmt::Display for EscalationAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Rejoin => write!(f, "rejoin"),
            Self::Rescan => write!(f, "rescan"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// しきい値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultThresholds {
    pub rejoin_count: u8,
    pub rejoin_timeout: Duration,
    pub rescan_timeout: Duration,
    pub restart_timeout: Duration,
}

impl From<&BRouteSettings> for FaultThresholds {
    fn from(settings: &BRouteSettings) -> Self {
        Self {
            rejoin_count: settings.rejoin_count,
            rejoin_timeout: settings.rejoin_timeout,
            rescan_timeout: settings.rescan_timeout,
            restart_timeout: settings.restart_timeout,
        }
    }
}

/// 連続失敗を数えて復旧手順を決める
///
/// 劣化期間は連続失敗が `rejoin_count` に達したとき(またはセッション側が
/// 劣化を宣言したとき)に始まり、次の成功で終わる。
#[derive(Debug)]
pub struct FaultMonitor {
    thresholds: FaultThresholds,
    misses: u32,
    last_success: Instant,
    last_failure: Option<(FailureKind, Instant)>,
    degraded_since: Option<Instant>,
    last_rejoin: Option<Instant>,
    last_rescan: Option<Instant>,
    last_restart: Option<Instant>,
}

impl FaultMonitor {
    pub fn new(thresholds: FaultThresholds, now: Instant) -> Self {
        Self {
            thresholds,
            misses: 0,
            last_success: now,
            last_failure: None,
            degraded_since: None,
            last_rejoin: None,
            last_rescan: None,
            last_restart: None,
        }
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.misses
    }

    pub fn last_failure(&self) -> Option<(FailureKind, Instant)> {
        self.last_failure
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_since.is_some()
    }

    pub fn on_success(&mut self, now: Instant) {
        if self.degraded_since.take().is_some() {
            tracing::info!("recovered after {} consecutive misses", self.misses);
        }
        self.misses = 0;
        self.last_success = now;
    }

    pub fn on_failure(&mut self, kind: FailureKind, now: Instant) {
        self.misses = self.misses.saturating_add(1);
        self.last_failure = Some((kind, now));
        tracing::warn!("{:?} (consecutive misses {})", kind, self.misses);
        if self.misses >= u32::from(self.thresholds.rejoin_count) {
            self.mark_degraded(now);
        }
    }

    /// 劣化期間に入る(すでに劣化中なら何もしない)
    pub fn mark_degraded(&mut self, now: Instant) {
        if self.degraded_since.is_none() {
            tracing::warn!("degraded");
            self.degraded_since = Some(now);
        }
    }

    /// 今実行すべき復旧手順
    pub fn evaluate(&mut self, now: Instant) -> Option<EscalationAction> {
        let degraded_since = self.degraded_since?;
        let elapsed = |from: Instant, since: Option<Instant>| {
            let from = since.map_or(from, |t| t.max(from));
            now.saturating_duration_since(from)
        };
        let restart = elapsed(degraded_since, self.last_restart) >= self.thresholds.restart_timeout;
        let rescan = elapsed(degraded_since, self.last_rescan) >= self.thresholds.rescan_timeout;
        let rejoin = elapsed(self.last_success, self.last_rejoin) >= self.thresholds.rejoin_timeout;

        let action = if restart {
            self.last_restart = Some(now);
            self.last_rescan = Some(now);
            self.last_rejoin = Some(now);
            EscalationAction::Restart
        } else if rescan {
            self.last_rescan = Some(now);
            self.last_rejoin = Some(now);
            EscalationAction::Rescan
        } else if rejoin {
            self.last_rejoin = Some(now);
            EscalationAction::Rejoin
        } else {
            return None;
        };
        tracing::error!(
            "escalate to {} after {} consecutive misses",
            action,
            self.misses
        );
        Some(action)
    }
}

#[cfg(test)]
fn thresholds() -> FaultThresholds {
    FaultThresholds {
        rejoin_count: 10,
        rejoin_timeout: Duration::from_secs(120),
        rescan_timeout: Duration::from_secs(240),
        restart_timeout: Duration::from_secs(360),
    }
}

#[test]
fn test_success_resets_misses() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(thresholds(), t0);
    for _ in 0..3 {
        fault.on_failure(FailureKind::Timeout, t0);
    }
    assert_eq!(fault.consecutive_misses(), 3);
    assert!(!fault.is_degraded());
    fault.on_success(t0 + Duration::from_secs(1));
    assert_eq!(fault.consecutive_misses(), 0);
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(1000)), None);
}

#[test]
fn test_rejoin_once() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(thresholds(), t0);
    for _ in 0..9 {
        fault.on_failure(FailureKind::Timeout, t0);
    }
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(120)), None);
    fault.on_failure(FailureKind::Timeout, t0);
    assert!(fault.is_degraded());
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(119)), None);
    assert_eq!(
        fault.evaluate(t0 + Duration::from_secs(120)),
        Some(EscalationAction::Rejoin)
    );
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(121)), None);
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(239)), None);
}

#[test]
fn test_restart_after_restart_timeout() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(thresholds(), t0);
    for _ in 0..10 {
        fault.on_failure(FailureKind::ParseError, t0);
    }
    // 重い手順だけが選ばれる
    assert_eq!(
        fault.evaluate(t0 + Duration::from_secs(360)),
        Some(EscalationAction::Restart)
    );
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(400)), None);
    assert_eq!(
        fault.evaluate(t0 + Duration::from_secs(480)),
        Some(EscalationAction::Rejoin)
    );
}

#[test]
fn test_escalation_ladder() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(thresholds(), t0);
    let at = |secs| t0 + Duration::from_secs(secs);
    for _ in 0..10 {
        fault.on_failure(FailureKind::Timeout, at(100));
    }
    assert_eq!(fault.evaluate(at(120)), Some(EscalationAction::Rejoin));
    assert_eq!(fault.evaluate(at(240)), Some(EscalationAction::Rejoin));
    assert_eq!(fault.evaluate(at(340)), Some(EscalationAction::Rescan));
    assert_eq!(fault.evaluate(at(400)), None);
    assert_eq!(fault.evaluate(at(460)), Some(EscalationAction::Restart));
    assert_eq!(fault.evaluate(at(580)), Some(EscalationAction::Rejoin));
    assert_eq!(fault.evaluate(at(700)), Some(EscalationAction::Rescan));

    // 成功で劣化期間が終わる
    fault.on_success(at(701));
    assert!(!fault.is_degraded());
    assert_eq!(fault.evaluate(at(2000)), None);
}

#[test]
fn test_marked_degraded_without_threshold() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(thresholds(), t0);
    fault.on_failure(FailureKind::EmptyScan, t0);
    fault.mark_degraded(t0);
    assert_eq!(
        fault.evaluate(t0 + Duration::from_secs(240)),
        Some(EscalationAction::Rescan)
    );
}

#[test]
fn test_rejoin_count_zero() {
    let t0 = Instant::now();
    let mut fault = FaultMonitor::new(
        FaultThresholds {
            rejoin_count: 0,
            ..thresholds()
        },
        t0,
    );
    assert!(!fault.is_degraded());
    assert_eq!(fault.evaluate(t0 + Duration::from_secs(1000)), None);
    fault.on_failure(FailureKind::Transport, t0);
    assert!(fault.is_degraded());
}
