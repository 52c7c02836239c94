// コマンドの送信と応答の待ち合わせ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::EchonetliteFrame;
use crate::reading::MetricKind;
use crate::skstack::{self, Epandesc, Erxudp, Event, SkCommand, SkRxD};
use crate::transport::Transport;
use std::fmt;
use std::io;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// ログイン手順
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Reset,
    Version,
    DisableEcho,
    ReadOption,
    WriteOption,
    SetPassword,
    SetRouteBId,
    Scan,
    SetChannel,
    SetPanId,
    Join,
}

/// 要求の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Login(LoginStep),
    Metric(MetricKind),
    EnergyParameters,
}

impl RequestKind {
    pub const PROPERTY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Login(LoginStep::Scan) => Self::SCAN_TIMEOUT,
            Self::Login(LoginStep::Join) => Self::JOIN_TIMEOUT,
            Self::Login(_) => Self::COMMAND_TIMEOUT,
            Self::Metric(_) | Self::EnergyParameters => Self::PROPERTY_TIMEOUT,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Login(step) => write!(f, "login {:?}", step),
            Self::Metric(kind) => write!(f, "get {}", kind),
            Self::EnergyParameters => write!(f, "get energy parameters"),
        }
    }
}

/// 期待する応答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Ok,
    Scan,
    Join,
    Udp { tid: u16 },
}

/// 応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Option<String>),
    ScanDone(Vec<Epandesc>),
    Joined,
    Udp(Vec<u8>),
}

/// 要求の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response(Response),
    Timeout,
    MalformedReply(String),
}

/// poll() が返すもの
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Completed { kind: RequestKind, outcome: Outcome },
    Unsolicited(SkRxD),
    TransportFault(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("busy with {pending}, {rejected} is dropped")]
    Busy {
        pending: RequestKind,
        rejected: RequestKind,
    },
    #[error("transport write error: {0}")]
    Io(#[from] io::Error),
    #[error("echonetlite frame encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    issued_at: Instant,
    deadline: Instant,
    expect: Expect,
    scanned: Vec<Epandesc>,
}

enum Accept {
    Complete(Outcome),
    Consumed,
    Pass(SkRxD),
}

// ERXUDPのデータ部分からTIDを取り出す
fn frame_tid(data: &[u8]) -> Option<u16> {
    match data {
        [_, _, a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

impl PendingRequest {
    fn accept(&mut self, rxd: SkRxD) -> Accept {
        match (self.expect, rxd) {
            (_, SkRxD::Void) => Accept::Consumed,
            (_, SkRxD::Echo(line)) => {
                tracing::trace!("echo back: {}", line);
                Accept::Consumed
            }
            (_, SkRxD::Fail(code)) => {
                Accept::Complete(Outcome::MalformedReply(format!("FAIL ER{:02X}", code)))
            }
            (Expect::Ok, SkRxD::Ok) => Accept::Complete(Outcome::Response(Response::Ok(None))),
            (Expect::Ok, SkRxD::OkWith(value)) => {
                Accept::Complete(Outcome::Response(Response::Ok(Some(value))))
            }
            (Expect::Ok, SkRxD::Ever(version)) => {
                tracing::info!("SKSTACK version {}", version);
                Accept::Consumed
            }
            // SKSCAN, SKJOIN, SKSENDTO の受付応答
            (_, SkRxD::Ok | SkRxD::OkWith(_)) => Accept::Consumed,
            (Expect::Scan, SkRxD::Epandesc(epandesc)) => {
                tracing::debug!("{:?}", epandesc);
                self.scanned.push(epandesc);
                Accept::Consumed
            }
            (Expect::Scan, SkRxD::Event(event)) => match event.code {
                Event::ACTIVE_SCAN_DONE => Accept::Complete(Outcome::Response(
                    Response::ScanDone(std::mem::take(&mut self.scanned)),
                )),
                Event::RECEIVED_BEACON => Accept::Consumed,
                _ => Accept::Pass(SkRxD::Event(event)),
            },
            (Expect::Join, SkRxD::Event(event)) => match event.code {
                Event::PANA_CONNECTED => Accept::Complete(Outcome::Response(Response::Joined)),
                Event::PANA_FAILED => {
                    Accept::Complete(Outcome::MalformedReply(event.describe().to_owned()))
                }
                Event::UDP_SENT => Accept::Consumed,
                _ => Accept::Pass(SkRxD::Event(event)),
            },
            (Expect::Join, SkRxD::Erxudp(erxudp)) if erxudp.destination_port == Erxudp::PANA_PORT => {
                tracing::trace!("PANA message from {}", skstack::ipv6_text(&erxudp.sender));
                Accept::Consumed
            }
            (Expect::Udp { .. }, SkRxD::Event(event)) if event.code == Event::UDP_SENT => {
                match event.param {
                    Some(1) => Accept::Complete(Outcome::MalformedReply(
                        "UDP send failed".to_owned(),
                    )),
                    _ => Accept::Consumed,
                }
            }
            (Expect::Udp { tid }, SkRxD::Erxudp(erxudp))
                if erxudp.destination_port == Erxudp::ECHONETLITE_PORT
                    && frame_tid(&erxudp.data) == Some(tid) =>
            {
                Accept::Complete(Outcome::Response(Response::Udp(erxudp.data)))
            }
            (_, rxd) => Accept::Pass(rxd),
        }
    }
}

/// 1要求ずつ送って応答を待つ
pub struct CommandChannel<T: Transport> {
    transport: T,
    pending: Option<PendingRequest>,
    partial: Vec<String>,
    next_tid: u16,
}

impl<T: Transport> CommandChannel<T> {
    // 複数行の応答はこれ以上長くならない
    const MAX_PARTIAL_LINES: usize = 8;
    // 1回のpollで読む最大行数
    const MAX_LINES_PER_POLL: usize = 64;

    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: None,
            partial: Vec::new(),
            next_tid: 1,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_kind(&self) -> Option<RequestKind> {
        self.pending.as_ref().map(|p| p.kind)
    }

    /// いつ送った要求か
    pub fn pending_since(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.issued_at)
    }

    /// コマンドを送る
    pub fn send(
        &mut self,
        kind: RequestKind,
        command: SkCommand,
        now: Instant,
    ) -> Result<(), ChannelError> {
        let expect = match kind {
            RequestKind::Login(LoginStep::Scan) => Expect::Scan,
            RequestKind::Login(LoginStep::Join) => Expect::Join,
            RequestKind::Login(_) => Expect::Ok,
            RequestKind::Metric(_) | RequestKind::EnergyParameters => match &command {
                SkCommand::SendTo { payload, .. } => Expect::Udp {
                    tid: frame_tid(payload).unwrap_or_default(),
                },
                _ => Expect::Ok,
            },
        };
        self.issue(kind, expect, command, now)
    }

    /// スマートメーターにプロパティ値読み出し要求を送る
    pub fn send_get(
        &mut self,
        kind: RequestKind,
        destination: Ipv6Addr,
        epcs: &[u8],
        now: Instant,
    ) -> Result<u16, ChannelError> {
        if let Some(pending) = self.pending.as_ref() {
            return Err(self.busy(pending.kind, kind));
        }
        let tid = self.next_tid;
        let frame = EchonetliteFrame::get_request(tid, epcs);
        let command = SkCommand::send_echonetlite(destination, &frame)?;
        self.issue(kind, Expect::Udp { tid }, command, now)?;
        self.next_tid = self.next_tid.wrapping_add(1);
        Ok(tid)
    }

    fn busy(&self, pending: RequestKind, rejected: RequestKind) -> ChannelError {
        tracing::warn!("busy with {}, {} is dropped", pending, rejected);
        ChannelError::Busy { pending, rejected }
    }

    fn issue(
        &mut self,
        kind: RequestKind,
        expect: Expect,
        command: SkCommand,
        now: Instant,
    ) -> Result<(), ChannelError> {
        if let Some(pending) = self.pending.as_ref() {
            return Err(self.busy(pending.kind, kind));
        }
        tracing::trace!(target: "Tx->", "{:?}", command);
        self.transport.write_line(&command.to_bytes())?;
        self.pending = Some(PendingRequest {
            kind,
            issued_at: now,
            deadline: now + kind.timeout(),
            expect,
            scanned: Vec::new(),
        });
        Ok(())
    }

    /// 受信した行を処理して、完了した要求と要求外の通知を返す
    pub fn poll(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for _ in 0..Self::MAX_LINES_PER_POLL {
            match self.transport.read_available_line() {
                Ok(Some(line)) => self.on_line(line, &mut deliveries),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("transport read error: {}", e);
                    deliveries.push(Delivery::TransportFault(e.to_string()));
                    break;
                }
            }
        }
        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            if let Some(pending) = self.pending.take() {
                tracing::warn!("{} timed out", pending.kind);
                deliveries.push(Delivery::Completed {
                    kind: pending.kind,
                    outcome: Outcome::Timeout,
                });
            }
        }
        deliveries
    }

    /// 待っている要求と受信途中の行を捨てる
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("{} is cancelled", pending.kind);
        }
        self.partial.clear();
    }

    /// 通信路ごと初期状態に戻す
    pub fn restart_transport(&mut self) -> io::Result<()> {
        self.reset();
        self.transport.restart()
    }

    fn on_line(&mut self, line: String, deliveries: &mut Vec<Delivery>) {
        tracing::trace!(target: "<-Rx", "{}", line);
        self.partial.push(line);
        match parse_lines(&self.partial) {
            Ok(rxd) => {
                self.partial.clear();
                self.dispatch(rxd, deliveries);
            }
            Err(Unparsed::Incomplete) if self.partial.len() < Self::MAX_PARTIAL_LINES => {}
            Err(_) => {
                // 直前までの行を捨てて、最後の行だけで読み直す
                let retry = self.partial.len() > 1;
                let last = self.partial.pop();
                if !self.partial.is_empty() {
                    tracing::trace!("discard {:?}", self.partial);
                }
                self.partial.clear();
                match last {
                    Some(line) if retry => self.on_line(line, deliveries),
                    Some(line) => tracing::trace!("discard {:?}", line),
                    None => {}
                }
            }
        }
    }

    fn dispatch(&mut self, rxd: SkRxD, deliveries: &mut Vec<Delivery>) {
        let accepted = match self.pending.as_mut() {
            Some(pending) => pending.accept(rxd),
            None => Accept::Pass(rxd),
        };
        match accepted {
            Accept::Complete(outcome) => {
                if let Some(pending) = self.pending.take() {
                    tracing::debug!("{} completed", pending.kind);
                    deliveries.push(Delivery::Completed {
                        kind: pending.kind,
                        outcome,
                    });
                }
            }
            Accept::Consumed => {}
            Accept::Pass(rxd @ (SkRxD::Event(_) | SkRxD::Erxudp(_) | SkRxD::Epandesc(_))) => {
                deliveries.push(Delivery::Unsolicited(rxd));
            }
            Accept::Pass(rxd) => tracing::debug!("discard {:?}", rxd),
        }
    }
}

enum Unparsed {
    Incomplete,
    Invalid,
}

// 行をつないで解析する
fn parse_lines(lines: &[String]) -> Result<SkRxD, Unparsed> {
    let text = lines
        .iter()
        .map(|line| format!("{}\r\n", line))
        .collect::<String>();
    match skstack::parser::parse_rxd(&text) {
        Ok((_rest, rxd)) => Ok(rxd),
        Err(nom::Err::Incomplete(_)) => Err(Unparsed::Incomplete),
        Err(_) => Err(Unparsed::Invalid),
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct LoopbackTransport {
    pub(crate) incoming: std::collections::VecDeque<String>,
    pub(crate) written: Vec<Vec<u8>>,
}

#[cfg(test)]
impl Transport for LoopbackTransport {
    fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_available_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.incoming.pop_front())
    }
}

#[cfg(test)]
fn push_lines(channel: &mut CommandChannel<LoopbackTransport>, lines: &[&str]) {
    channel
        .transport_mut()
        .incoming
        .extend(lines.iter().map(|s| s.to_string()));
}

#[test]
fn test_ok_reply() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    channel
        .send(RequestKind::Login(LoginStep::Version), SkCommand::Version, now)
        .unwrap();
    assert_eq!(channel.transport().written, vec![b"SKVER\r\n".to_vec()]);
    push_lines(&mut channel, &["SKVER", "EVER 1.2.10", "OK"]);
    assert_eq!(
        channel.poll(now),
        vec![Delivery::Completed {
            kind: RequestKind::Login(LoginStep::Version),
            outcome: Outcome::Response(Response::Ok(None)),
        }]
    );
    assert!(!channel.is_busy());
}

#[test]
fn test_busy() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    channel
        .send(RequestKind::Login(LoginStep::ReadOption), SkCommand::ReadOption, now)
        .unwrap();
    let busy = channel.send(RequestKind::Login(LoginStep::Version), SkCommand::Version, now);
    assert!(matches!(busy, Err(ChannelError::Busy { .. })));
    // 後の要求は書き込まれない
    assert_eq!(channel.transport().written.len(), 1);
    assert_eq!(channel.pending_since(), Some(now));
    assert_eq!(
        channel.pending_kind(),
        Some(RequestKind::Login(LoginStep::ReadOption))
    );
    push_lines(&mut channel, &["OK 01"]);
    assert_eq!(
        channel.poll(now),
        vec![Delivery::Completed {
            kind: RequestKind::Login(LoginStep::ReadOption),
            outcome: Outcome::Response(Response::Ok(Some("01".to_owned()))),
        }]
    );
}

#[test]
fn test_timeout_and_late_reply() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    channel
        .send(RequestKind::Login(LoginStep::Version), SkCommand::Version, now)
        .unwrap();
    assert!(channel.poll(now + Duration::from_secs(9)).is_empty());
    assert_eq!(
        channel.poll(now + Duration::from_secs(10)),
        vec![Delivery::Completed {
            kind: RequestKind::Login(LoginStep::Version),
            outcome: Outcome::Timeout,
        }]
    );
    // 遅れて届いたOKは捨てる
    push_lines(&mut channel, &["OK"]);
    assert!(channel.poll(now + Duration::from_secs(11)).is_empty());
}

#[test]
fn test_fail_reply() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    channel
        .send(RequestKind::Login(LoginStep::Version), SkCommand::Version, now)
        .unwrap();
    push_lines(&mut channel, &["FAIL ER04"]);
    assert_eq!(
        channel.poll(now),
        vec![Delivery::Completed {
            kind: RequestKind::Login(LoginStep::Version),
            outcome: Outcome::MalformedReply("FAIL ER04".to_owned()),
        }]
    );
}

#[test]
fn test_scan() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    channel
        .send(
            RequestKind::Login(LoginStep::Scan),
            SkCommand::ActiveScan { duration: 6 },
            now,
        )
        .unwrap();
    push_lines(
        &mut channel,
        &[
            "OK",
            "EVENT 20 FE80:0000:0000:0000:021D:1290:1234:5678",
            "EPANDESC",
            "  Channel:3B",
            "  Channel Page:09",
        ],
    );
    assert!(channel.poll(now).is_empty());
    push_lines(
        &mut channel,
        &[
            "  Pan ID:ABCD",
            "  Addr:001D129012345678",
            "  LQI:84",
            "  PairID:1234ABCD",
            "EVENT 22 FE80:0000:0000:0000:021D:1290:1234:5678",
        ],
    );
    let deliveries = channel.poll(now);
    let [Delivery::Completed { kind, outcome }] = &deliveries[..] else {
        panic!("{:?}", deliveries);
    };
    assert_eq!(*kind, RequestKind::Login(LoginStep::Scan));
    let Outcome::Response(Response::ScanDone(found)) = outcome else {
        panic!("{:?}", outcome);
    };
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].channel, 0x3b);
    assert_eq!(found[0].pan_id, 0xabcd);
    assert_eq!(found[0].lqi, 0x84);
}

#[test]
fn test_property_get() {
    let now = Instant::now();
    let meter: Ipv6Addr = "FE80::021D:1290:1234:5678".parse().unwrap();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    let tid = channel
        .send_get(RequestKind::Metric(MetricKind::Power), meter, &[0xe7], now)
        .unwrap();
    assert_eq!(tid, 1);
    let written = &channel.transport().written[0];
    assert!(written.starts_with(b"SKSENDTO 1 FE80:0000:0000:0000:021D:1290:1234:5678 0E1A 1 000E "));

    push_lines(
        &mut channel,
        &[
            "EVENT 21 FE80:0000:0000:0000:021D:1290:1234:5678 00",
            "OK",
            // TIDが違う通知
            "ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678 FF02:0000:0000:0000:0000:0000:0000:0001 0E1A 0E1A 001D129012345678 1 0012 1081000002880105FF017301E704000001F4",
            "ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678 FE80:0000:0000:0000:021D:1290:1234:0001 0E1A 0E1A 001D129012345678 1 0012 1081000102880105FF017201E704000001F4",
        ],
    );
    let deliveries = channel.poll(now);
    assert_eq!(deliveries.len(), 2);
    assert!(matches!(
        deliveries[0],
        Delivery::Unsolicited(SkRxD::Erxudp(_))
    ));
    assert_eq!(
        deliveries[1],
        Delivery::Completed {
            kind: RequestKind::Metric(MetricKind::Power),
            outcome: Outcome::Response(Response::Udp(vec![
                0x10, 0x81, 0x00, 0x01, 0x02, 0x88, 0x01, 0x05, 0xff, 0x01, 0x72, 0x01, 0xe7,
                0x04, 0x00, 0x00, 0x01, 0xf4
            ])),
        }
    );

    // 次の要求は別のTID
    let tid = channel
        .send_get(RequestKind::Metric(MetricKind::Power), meter, &[0xe7], now)
        .unwrap();
    assert_eq!(tid, 2);
    push_lines(
        &mut channel,
        &["EVENT 21 FE80:0000:0000:0000:021D:1290:1234:5678 01"],
    );
    assert_eq!(
        channel.poll(now),
        vec![Delivery::Completed {
            kind: RequestKind::Metric(MetricKind::Power),
            outcome: Outcome::MalformedReply("UDP send failed".to_owned()),
        }]
    );
}

#[test]
fn test_unsolicited_and_reset() {
    let now = Instant::now();
    let mut channel = CommandChannel::new(LoopbackTransport::default());
    push_lines(
        &mut channel,
        &[
            "OK",
            "EVENT 29 FE80:0000:0000:0000:021D:1290:1234:5678",
            "garbage line",
        ],
    );
    let deliveries = channel.poll(now);
    assert_eq!(deliveries.len(), 1);
    assert!(matches!(
        &deliveries[0],
        Delivery::Unsolicited(SkRxD::Event(e)) if e.code == Event::SESSION_EXPIRED
    ));

    // 受信途中のEPANDESCは reset() で捨てる
    channel
        .send(
            RequestKind::Login(LoginStep::Scan),
            SkCommand::ActiveScan { duration: 6 },
            now,
        )
        .unwrap();
    push_lines(&mut channel, &["EPANDESC", "  Channel:3B"]);
    assert!(channel.poll(now).is_empty());
    channel.reset();
    assert!(!channel.is_busy());
    push_lines(&mut channel, &["  Channel Page:09", "OK"]);
    assert!(channel.poll(now).is_empty());
}
