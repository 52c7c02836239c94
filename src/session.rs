// PANへの接続と再接続
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::channel::{ChannelError, CommandChannel, LoginStep, Outcome, RequestKind, Response};
use crate::fault::{EscalationAction, FailureKind, FaultMonitor};
use crate::skstack::authn::Credentials;
use crate::skstack::{self, Epandesc, Event, SkCommand};
use crate::transport::Transport;
use std::fmt;
use std::net::Ipv6Addr;
use std::time::Instant;

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joining,
    Joined,
    Degraded,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LoginStep {
    /// 成功したら次に進む手順
    fn next(self) -> Option<LoginStep> {
        match self {
            Self::Reset => Some(Self::Version),
            Self::Version => Some(Self::DisableEcho),
            Self::DisableEcho => Some(Self::ReadOption),
            Self::ReadOption | Self::WriteOption => Some(Self::SetPassword),
            Self::SetPassword => Some(Self::SetRouteBId),
            Self::SetRouteBId => Some(Self::Scan),
            Self::Scan => Some(Self::SetChannel),
            Self::SetChannel => Some(Self::SetPanId),
            Self::SetPanId => Some(Self::Join),
            Self::Join => None,
        }
    }
}

/// ログインとPANへの再接続を受け持つ
#[derive(Debug)]
pub struct SessionManager {
    credentials: Option<Credentials>,
    state: SessionState,
    next_step: Option<LoginStep>,
    pan: Option<Epandesc>,
    scan_attempts: u8,
    // SKSETRBID まで済んでいる
    registered: bool,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// スキャンを諦めるまでの回数
    pub const MAX_SCAN_ATTEMPTS: u8 = 5;
    /// SKSCAN の duration
    pub const SCAN_DURATION: u8 = 6;
    /// WOPT で設定する受信データ表示形式(ASCII)
    pub const ASCII_MODE: &'static str = "01";

    pub fn new() -> Self {
        Self {
            credentials: None,
            state: SessionState::Unjoined,
            next_step: None,
            pan: None,
            scan_attempts: 0,
            registered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 見つけたPAN
    pub fn pan(&self) -> Option<&Epandesc> {
        self.pan.as_ref()
    }

    /// 接続中のスマートメーターのアドレス
    pub fn destination(&self) -> Option<Ipv6Addr> {
        match self.state {
            SessionState::Joined => self.pan.as_ref().map(Epandesc::link_local_address),
            _ => None,
        }
    }

    /// ログインを始める
    pub fn begin(&mut self, credentials: Credentials) {
        tracing::info!("login with ID {}", credentials.id);
        self.credentials = Some(credentials);
        self.scan_attempts = 0;
        self.registered = false;
        self.next_step = Some(LoginStep::Version);
        self.transition(SessionState::Joining);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            tracing::info!("session {} -> {}", self.state, to);
            self.state = to;
        }
    }

    fn command(&self, step: LoginStep) -> Option<SkCommand> {
        let credentials = self.credentials.as_ref()?;
        let command = match step {
            LoginStep::Reset => SkCommand::Reset,
            LoginStep::Version => SkCommand::Version,
            LoginStep::DisableEcho => SkCommand::disable_echo_back(),
            LoginStep::ReadOption => SkCommand::ReadOption,
            LoginStep::WriteOption => SkCommand::WriteOption(1),
            LoginStep::SetPassword => SkCommand::SetPassword(credentials.password.clone()),
            LoginStep::SetRouteBId => SkCommand::SetRouteBId(credentials.id.clone()),
            LoginStep::Scan => SkCommand::ActiveScan {
                duration: Self::SCAN_DURATION,
            },
            LoginStep::SetChannel => SkCommand::set_channel(self.pan.as_ref()?.channel),
            LoginStep::SetPanId => SkCommand::set_pan_id(self.pan.as_ref()?.pan_id),
            LoginStep::Join => SkCommand::Join(self.pan.as_ref()?.link_local_address()),
        };
        Some(command)
    }

    /// 通信路が空いていれば次の手順を送る
    pub fn poll<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        fault: &mut FaultMonitor,
        now: Instant,
    ) {
        let Some(step) = self.next_step else {
            return;
        };
        if channel.is_busy() {
            return;
        }
        let Some(command) = self.command(step) else {
            // PANが分からなければスキャンからやり直す
            self.next_step = self.credentials.as_ref().map(|_| LoginStep::Scan);
            return;
        };
        tracing::debug!("{:?}", command);
        match channel.send(RequestKind::Login(step), command, now) {
            Ok(()) => {
                self.next_step = None;
                if self.state == SessionState::Unjoined {
                    self.transition(SessionState::Joining);
                }
            }
            Err(ChannelError::Busy { .. }) => {}
            Err(e) => {
                tracing::warn!("{}", e);
                self.note_failure(FailureKind::Transport, fault, now);
            }
        }
    }

    // 失敗を記録して、しきい値を超えたら劣化状態にする
    fn note_failure(&mut self, kind: FailureKind, fault: &mut FaultMonitor, now: Instant) -> bool {
        fault.on_failure(kind, now);
        if fault.is_degraded() {
            self.next_step = None;
            self.transition(SessionState::Degraded);
            true
        } else {
            false
        }
    }

    /// ログイン手順の結果
    pub fn on_outcome(
        &mut self,
        step: LoginStep,
        outcome: Outcome,
        fault: &mut FaultMonitor,
        now: Instant,
    ) {
        if self.state == SessionState::Joined {
            tracing::debug!("ignore {:?} outcome while joined", step);
            return;
        }
        match (step, outcome) {
            (LoginStep::ReadOption, Outcome::Response(Response::Ok(mode))) => {
                self.next_step = match mode.as_deref() {
                    Some(Self::ASCII_MODE) => Some(LoginStep::SetPassword),
                    _ => Some(LoginStep::WriteOption),
                };
            }
            (LoginStep::Scan, Outcome::Response(Response::ScanDone(found))) => {
                match found.into_iter().max_by_key(|pan| pan.lqi) {
                    Some(pan) => {
                        tracing::info!(
                            "found PAN {:04X} on channel {:02X} (LQI {:02X}) {}",
                            pan.pan_id,
                            pan.channel,
                            pan.lqi,
                            skstack::ipv6_text(&pan.link_local_address())
                        );
                        self.pan = Some(pan);
                        self.scan_attempts = 0;
                        self.next_step = Some(LoginStep::SetChannel);
                    }
                    None => self.scan_failed(FailureKind::EmptyScan, fault, now),
                }
            }
            (LoginStep::Scan, Outcome::Timeout) => self.scan_failed(FailureKind::Timeout, fault, now),
            (LoginStep::Scan, Outcome::MalformedReply(reason)) => {
                tracing::warn!("scan failed: {}", reason);
                self.scan_failed(FailureKind::MalformedReply, fault, now)
            }
            (LoginStep::Join, Outcome::Response(Response::Joined)) => self.joined(fault, now),
            (LoginStep::Join, Outcome::Timeout) => {
                if !self.note_failure(FailureKind::Timeout, fault, now) {
                    self.next_step = Some(LoginStep::Join);
                }
            }
            (LoginStep::Join, Outcome::MalformedReply(reason)) => {
                tracing::warn!("join failed: {}", reason);
                if !self.note_failure(FailureKind::MalformedReply, fault, now) {
                    self.next_step = Some(LoginStep::Join);
                }
            }
            (step, Outcome::Response(Response::Ok(_))) => {
                if step == LoginStep::SetRouteBId {
                    self.registered = true;
                }
                self.next_step = step.next();
            }
            (step, Outcome::Timeout) => {
                if !self.note_failure(FailureKind::Timeout, fault, now) {
                    self.next_step = Some(step);
                }
            }
            (step, Outcome::MalformedReply(reason)) => {
                tracing::warn!("{:?} failed: {}", step, reason);
                if !self.note_failure(FailureKind::MalformedReply, fault, now) {
                    self.next_step = Some(LoginStep::Version);
                }
            }
            (step, Outcome::Response(response)) => {
                tracing::warn!("{:?} unexpected response {:?}", step, response);
                if !self.note_failure(FailureKind::MalformedReply, fault, now) {
                    self.next_step = Some(LoginStep::Version);
                }
            }
        }
    }

    fn scan_failed(&mut self, kind: FailureKind, fault: &mut FaultMonitor, now: Instant) {
        self.scan_attempts = self.scan_attempts.saturating_add(1);
        if self.note_failure(kind, fault, now) {
            return;
        }
        if self.scan_attempts < Self::MAX_SCAN_ATTEMPTS {
            tracing::info!("no PAN found, scan again ({})", self.scan_attempts);
            self.next_step = Some(LoginStep::Scan);
        } else {
            tracing::warn!("no PAN found after {} scans", self.scan_attempts);
            self.scan_attempts = 0;
            self.next_step = None;
            fault.mark_degraded(now);
            self.transition(SessionState::Degraded);
        }
    }

    fn joined(&mut self, fault: &mut FaultMonitor, now: Instant) {
        fault.on_success(now);
        self.next_step = None;
        self.transition(SessionState::Joined);
    }

    /// 要求していないイベント
    pub fn on_event(&mut self, event: &Event, fault: &mut FaultMonitor, now: Instant) {
        match event.code {
            _ if event.is_session_lost() => {
                tracing::warn!("{} {}", event.describe(), skstack::ipv6_text(&event.sender));
                if self.state == SessionState::Joined {
                    self.transition(SessionState::Joining);
                    self.next_step = Some(LoginStep::Join);
                }
            }
            Event::PANA_CONNECTED => {
                if matches!(self.state, SessionState::Joining | SessionState::Degraded)
                    && self.pan.is_some()
                {
                    tracing::info!("{}", event.describe());
                    self.joined(fault, now);
                }
            }
            Event::TRANSMIT_LIMIT_ON => tracing::warn!("{}", event.describe()),
            Event::TRANSMIT_LIMIT_OFF => tracing::info!("{}", event.describe()),
            _ => tracing::debug!("{} {}", event.describe(), skstack::ipv6_text(&event.sender)),
        }
    }

    /// 計測要求の失敗(失敗の記録は呼び出し側で済んでいる)
    pub fn on_poll_failure(&mut self, fault: &FaultMonitor) {
        if fault.is_degraded() && self.state == SessionState::Joined {
            self.next_step = None;
            self.transition(SessionState::Degraded);
        }
    }

    /// 復旧手順を実行する
    pub fn apply<T: Transport>(
        &mut self,
        action: EscalationAction,
        channel: &mut CommandChannel<T>,
        now: Instant,
    ) {
        if self.credentials.is_none() {
            return;
        }
        match action {
            EscalationAction::Rejoin if self.pan.is_none() => {
                // 接続先が無いので走査のやり直しを待つ
                tracing::info!("no PAN to rejoin, wait for rescan");
                return;
            }
            EscalationAction::Rejoin => {
                channel.reset();
                self.next_step = Some(LoginStep::Join);
                self.transition(SessionState::Joining);
            }
            EscalationAction::Rescan => {
                channel.reset();
                self.pan = None;
                self.scan_attempts = 0;
                self.transition(SessionState::Unjoined);
                self.next_step = if self.registered {
                    Some(LoginStep::Scan)
                } else {
                    Some(LoginStep::Version)
                };
            }
            EscalationAction::Restart => {
                if let Err(e) = channel.restart_transport() {
                    tracing::warn!("transport restart failed: {}", e);
                }
                self.pan = None;
                self.scan_attempts = 0;
                self.registered = false;
                self.transition(SessionState::Unjoined);
                self.next_step = Some(LoginStep::Reset);
            }
        }
        tracing::debug!("{} at {:?}, next {:?}", action, now, self.next_step);
    }
}

#[cfg(test)]
fn test_credentials() -> Credentials {
    Credentials::new("0123456789ABCDEF0123456789ABCDEF", "secret").unwrap()
}

#[cfg(test)]
fn test_pan() -> Epandesc {
    Epandesc {
        channel: 0x3b,
        channel_page: 9,
        pan_id: 0xabcd,
        addr: 0x001D_1290_1234_5678,
        lqi: 0x84,
        pair_id: 0x1234_abcd,
    }
}

#[cfg(test)]
fn test_fault(now: Instant) -> FaultMonitor {
    FaultMonitor::new(
        crate::fault::FaultThresholds {
            rejoin_count: 3,
            rejoin_timeout: std::time::Duration::from_secs(120),
            rescan_timeout: std::time::Duration::from_secs(240),
            restart_timeout: std::time::Duration::from_secs(360),
        },
        now,
    )
}

#[test]
fn test_login_sequence_steps() {
    let now = Instant::now();
    let mut fault = test_fault(now);
    let mut session = SessionManager::new();
    assert_eq!(session.state(), SessionState::Unjoined);
    session.begin(test_credentials());
    assert_eq!(session.state(), SessionState::Joining);

    let ok = || Outcome::Response(Response::Ok(None));
    session.on_outcome(LoginStep::Version, ok(), &mut fault, now);
    assert_eq!(session.next_step, Some(LoginStep::DisableEcho));
    session.on_outcome(
        LoginStep::ReadOption,
        Outcome::Response(Response::Ok(Some("00".to_owned()))),
        &mut fault,
        now,
    );
    assert_eq!(session.next_step, Some(LoginStep::WriteOption));
    session.on_outcome(
        LoginStep::ReadOption,
        Outcome::Response(Response::Ok(Some("01".to_owned()))),
        &mut fault,
        now,
    );
    assert_eq!(session.next_step, Some(LoginStep::SetPassword));

    // LQIの一番高いPANを選ぶ
    let weak = Epandesc {
        lqi: 0x20,
        pan_id: 0x1111,
        ..test_pan()
    };
    session.on_outcome(
        LoginStep::Scan,
        Outcome::Response(Response::ScanDone(vec![weak, test_pan()])),
        &mut fault,
        now,
    );
    assert_eq!(session.pan().map(|p| p.pan_id), Some(0xabcd));
    assert_eq!(session.next_step, Some(LoginStep::SetChannel));
    assert_eq!(session.destination(), None);

    session.on_outcome(
        LoginStep::Join,
        Outcome::Response(Response::Joined),
        &mut fault,
        now,
    );
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(
        session.destination(),
        Some(test_pan().link_local_address())
    );
}

#[test]
fn test_scan_gives_up() {
    let now = Instant::now();
    let mut fault = FaultMonitor::new(
        crate::fault::FaultThresholds {
            rejoin_count: 10,
            rejoin_timeout: std::time::Duration::from_secs(120),
            rescan_timeout: std::time::Duration::from_secs(240),
            restart_timeout: std::time::Duration::from_secs(360),
        },
        now,
    );
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    for n in 1..SessionManager::MAX_SCAN_ATTEMPTS {
        session.on_outcome(
            LoginStep::Scan,
            Outcome::Response(Response::ScanDone(vec![])),
            &mut fault,
            now,
        );
        assert_eq!(session.state(), SessionState::Joining, "attempt {}", n);
        assert_eq!(session.next_step, Some(LoginStep::Scan));
    }
    session.on_outcome(LoginStep::Scan, Outcome::Timeout, &mut fault, now);
    assert_eq!(session.state(), SessionState::Degraded);
    assert_eq!(session.next_step, None);
    assert!(fault.is_degraded());
    assert_eq!(fault.consecutive_misses(), 5);
}

#[test]
fn test_join_timeouts_degrade() {
    let now = Instant::now();
    let mut fault = test_fault(now);
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    session.pan = Some(test_pan());
    for _ in 0..2 {
        session.on_outcome(LoginStep::Join, Outcome::Timeout, &mut fault, now);
        assert_eq!(session.next_step, Some(LoginStep::Join));
    }
    session.on_outcome(LoginStep::Join, Outcome::Timeout, &mut fault, now);
    assert_eq!(session.state(), SessionState::Degraded);
    assert_eq!(session.next_step, None);
}

#[test]
fn test_session_lost_event() {
    let now = Instant::now();
    let mut fault = test_fault(now);
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    session.pan = Some(test_pan());
    session.on_outcome(
        LoginStep::Join,
        Outcome::Response(Response::Joined),
        &mut fault,
        now,
    );
    let expired = Event {
        code: Event::SESSION_EXPIRED,
        sender: test_pan().link_local_address(),
        param: None,
    };
    session.on_event(&expired, &mut fault, now);
    assert_eq!(session.state(), SessionState::Joining);
    assert_eq!(session.next_step, Some(LoginStep::Join));

    let connected = Event {
        code: Event::PANA_CONNECTED,
        ..expired
    };
    session.on_event(&connected, &mut fault, now);
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.next_step, None);
}

#[test]
fn test_fail_restarts_from_version() {
    let now = Instant::now();
    let mut fault = test_fault(now);
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    let ok = || Outcome::Response(Response::Ok(None));
    session.on_outcome(LoginStep::SetPassword, ok(), &mut fault, now);
    assert_eq!(session.next_step, Some(LoginStep::SetRouteBId));

    // FAIL ER04
    session.on_outcome(
        LoginStep::SetRouteBId,
        Outcome::MalformedReply("FAIL ER04".to_owned()),
        &mut fault,
        now,
    );
    assert_eq!(session.next_step, Some(LoginStep::Version));
    assert_eq!(session.state(), SessionState::Joining);
    assert_eq!(fault.consecutive_misses(), 1);

    // タイムアウトは同じ手順を繰り返す
    session.on_outcome(LoginStep::SetPassword, Outcome::Timeout, &mut fault, now);
    assert_eq!(session.next_step, Some(LoginStep::SetPassword));
}

#[test]
fn test_rescan_action() {
    use crate::channel::LoopbackTransport;

    let now = Instant::now();
    let mut fault = test_fault(now);
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    let ok = || Outcome::Response(Response::Ok(None));
    session.on_outcome(LoginStep::SetRouteBId, ok(), &mut fault, now);
    session.pan = Some(test_pan());
    session.next_step = None;
    session.transition(SessionState::Degraded);
    channel
        .send(
            RequestKind::Login(LoginStep::Join),
            SkCommand::Join(test_pan().link_local_address()),
            now,
        )
        .unwrap();

    // 送信中の要求を捨てて走査からやり直す
    session.apply(EscalationAction::Rescan, &mut channel, now);
    assert!(!channel.is_busy());
    assert_eq!(session.pan(), None);
    assert_eq!(session.state(), SessionState::Unjoined);
    assert_eq!(session.next_step, Some(LoginStep::Scan));

    session.poll(&mut channel, &mut fault, now);
    assert_eq!(session.state(), SessionState::Joining);
    assert_eq!(
        channel.pending_kind(),
        Some(RequestKind::Login(LoginStep::Scan))
    );
    let written = &channel.transport().written;
    assert_eq!(written.len(), 2);
    assert!(written[1].starts_with(b"SKSCAN"));

    // PANが無いうちの再接続は何もしない
    session.apply(EscalationAction::Rejoin, &mut channel, now);
    assert!(channel.is_busy());
    assert_eq!(session.state(), SessionState::Joining);
    assert_eq!(session.next_step, None);
}

#[test]
fn test_rescan_before_registration() {
    use crate::channel::LoopbackTransport;

    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    let mut session = SessionManager::new();
    session.begin(test_credentials());
    session.next_step = None;
    session.transition(SessionState::Degraded);
    // 認証情報を設定する前ならログインし直す
    session.apply(EscalationAction::Rescan, &mut channel, now);
    assert_eq!(session.state(), SessionState::Unjoined);
    assert_eq!(session.next_step, Some(LoginStep::Version));
}
