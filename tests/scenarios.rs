// 模擬スマートメーターを相手にした結合テスト
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use broute::fault::FailureKind;
use broute::session::SessionState;
use broute::skstack::authn::Credentials;
use broute::{BRoute, BRouteSettings, MetricKind, Publish, Reading, Transport, Unit};
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

const METER: &str = "FE80:0000:0000:0000:021D:1290:1234:5678";
const TICK: Duration = Duration::from_millis(100);

/// 模擬スマートメーター(BP35A1込み)
struct Meter {
    join_acks: bool,
    answers_udp: bool,
    power_edt: Vec<u8>,
    energy_edt: Vec<u8>,
    coefficient_edt: Vec<u8>,
    unit_edt: Vec<u8>,
    written: Vec<Vec<u8>>,
    incoming: VecDeque<String>,
    restarts: usize,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            join_acks: true,
            answers_udp: true,
            power_edt: 500i32.to_be_bytes().to_vec(),
            energy_edt: 12345u32.to_be_bytes().to_vec(),
            coefficient_edt: vec![0, 0, 0, 1],
            unit_edt: vec![0x01],
            written: Vec::new(),
            incoming: VecDeque::new(),
            restarts: 0,
        }
    }
}

// SKSENDTO のバイナリ部分
fn sendto_payload(bytes: &[u8]) -> Option<&[u8]> {
    let (sixth_space, _) = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b' ')
        .nth(5)?;
    bytes.get(sixth_space + 1..)
}

impl Meter {
    fn respond(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        let lines: &[&str] = if text.starts_with("SKVER") {
            &["EVER 1.2.10", "OK"]
        } else if text.starts_with("ROPT") {
            &["OK 01"]
        } else if text.starts_with("SKSCAN") {
            &[
                "OK",
                "EVENT 20 FE80:0000:0000:0000:021D:1290:1234:5678",
                "EPANDESC",
                "  Channel:3B",
                "  Channel Page:09",
                "  Pan ID:ABCD",
                "  Addr:001D129012345678",
                "  LQI:84",
                "  PairID:1234ABCD",
                "EVENT 22 FE80:0000:0000:0000:021D:1290:1234:5678",
            ]
        } else if text.starts_with("SKJOIN") {
            if self.join_acks {
                &[
                    "OK",
                    "EVENT 21 FE80:0000:0000:0000:021D:1290:1234:5678 00",
                    "EVENT 25 FE80:0000:0000:0000:021D:1290:1234:5678",
                ]
            } else {
                &["OK"]
            }
        } else if text.starts_with("SKSENDTO") {
            return self.respond_sendto(bytes);
        } else {
            &["OK"]
        };
        lines.iter().map(|s| s.to_string()).collect()
    }

    fn respond_sendto(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = vec![format!("EVENT 21 {} 00", METER), "OK".to_owned()];
        if !self.answers_udp {
            return lines;
        }
        let Some(request) = sendto_payload(bytes) else {
            return lines;
        };
        let mut frame = vec![0x10, 0x81, request[2], request[3], 0x02, 0x88, 0x01, 0x05, 0xff, 0x01, 0x72];
        let epcs = request[12..].chunks(2).map(|c| c[0]).collect::<Vec<u8>>();
        frame.push(epcs.len() as u8);
        for epc in epcs {
            let edt = match epc {
                0xe7 => &self.power_edt,
                0xe0 => &self.energy_edt,
                0xd3 => &self.coefficient_edt,
                0xe1 => &self.unit_edt,
                _ => continue,
            };
            frame.push(epc);
            frame.push(edt.len() as u8);
            frame.extend_from_slice(edt);
        }
        // 係数の無いメーターは Get_SNA で返す
        if self.coefficient_edt.is_empty() && request[12..].chunks(2).any(|c| c[0] == 0xd3) {
            frame[10] = 0x52;
        }
        lines.push(format!(
            "ERXUDP {} FE80:0000:0000:0000:021D:1290:1234:0001 0E1A 0E1A 001D129012345678 1 {:04X} {}",
            METER,
            frame.len(),
            frame.iter().map(|b| format!("{:02X}", b)).collect::<String>()
        ));
        lines
    }

    /// 定時積算電力量計測値(0xEA)を通知する
    fn notify_fixed_time(&mut self) {
        let frame = [
            0x10, 0x81, 0x00, 0x00, 0x02, 0x88, 0x01, 0x05, 0xff, 0x01, 0x73, 0x01, 0xea, 0x0b, 0x07,
            0xe9, 0x06, 0x01, 0x0c, 0x1e, 0x00, 0x00, 0x00, 0x30, 0x39,
        ];
        self.incoming.push_back(format!(
            "ERXUDP {} FF02:0000:0000:0000:0000:0000:0000:0001 0E1A 0E1A 001D129012345678 1 {:04X} {}",
            METER,
            frame.len(),
            frame.iter().map(|b| format!("{:02X}", b)).collect::<String>()
        ));
    }

    /// 書き込まれたコマンド(SKSENDTOはコマンド名だけ)
    fn commands(&self) -> Vec<String> {
        self.written
            .iter()
            .map(|bytes| {
                if bytes.starts_with(b"SKSENDTO") {
                    "SKSENDTO".to_owned()
                } else {
                    String::from_utf8_lossy(bytes).trim_end().to_owned()
                }
            })
            .collect()
    }

    fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// SKSENDTOで要求したEPC
    fn requested_epcs(&self) -> Vec<Vec<u8>> {
        self.written
            .iter()
            .filter_map(|bytes| sendto_payload(bytes))
            .map(|payload| payload[12..].chunks(2).map(|c| c[0]).collect())
            .collect()
    }
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    meter: Rc<RefCell<Meter>>,
}

impl Transport for ScriptedTransport {
    fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut meter = self.meter.borrow_mut();
        meter.written.push(bytes.to_vec());
        let replies = meter.respond(bytes);
        meter.incoming.extend(replies);
        Ok(())
    }

    fn read_available_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.meter.borrow_mut().incoming.pop_front())
    }

    fn restart(&mut self) -> io::Result<()> {
        let mut meter = self.meter.borrow_mut();
        meter.restarts += 1;
        meter.incoming.clear();
        meter.written.push(b"<restart>".to_vec());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingPublish {
    readings: Rc<RefCell<Vec<Reading>>>,
}

impl Publish for RecordingPublish {
    fn publish(&mut self, reading: &Reading) {
        self.readings.borrow_mut().push(reading.clone());
    }
}

fn credentials() -> Credentials {
    Credentials::new("0123456789ABCDEF0123456789ABCDEF", "secret").unwrap()
}

struct Harness {
    broute: BRoute<ScriptedTransport, RecordingPublish>,
    meter: Rc<RefCell<Meter>>,
    readings: Rc<RefCell<Vec<Reading>>>,
    t0: Instant,
    now: Instant,
}

impl Harness {
    fn new(settings: BRouteSettings, meter: Meter) -> Self {
        let transport = ScriptedTransport {
            meter: Rc::new(RefCell::new(meter)),
        };
        let meter = transport.meter.clone();
        let publisher = RecordingPublish::default();
        let readings = publisher.readings.clone();
        let t0 = Instant::now();
        let mut broute = BRoute::new(settings, transport, publisher, t0);
        broute.setup(t0);
        Self {
            broute,
            meter,
            readings,
            t0,
            now: t0,
        }
    }

    fn step(&mut self) {
        self.now += TICK;
        self.broute.tick(self.now);
    }

    /// t0 から millis ミリ秒後まで進める
    fn run_until(&mut self, millis: u64) {
        let end = self.t0 + Duration::from_millis(millis);
        while self.now + TICK <= end {
            self.step();
        }
    }

    fn elapsed(&self) -> Duration {
        self.now - self.t0
    }
}

#[test]
fn login_reaches_joined() {
    let settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    let mut h = Harness::new(settings, Meter::default());
    assert_eq!(h.broute.session_state(), SessionState::Joining);
    h.run_until(2_000);
    assert_eq!(h.broute.session_state(), SessionState::Joined);
    assert_eq!(
        h.meter.borrow().commands(),
        vec![
            "SKVER",
            "SKSREG SFE 0",
            "ROPT",
            "SKSETPWD 06 secret",
            "SKSETRBID 0123456789ABCDEF0123456789ABCDEF",
            "SKSCAN 2 FFFFFFFF 6",
            "SKSREG S02 3B",
            "SKSREG S03 ABCD",
            "SKJOIN FE80:0000:0000:0000:021D:1290:1234:5678",
        ]
    );
    assert_eq!(h.broute.fault().consecutive_misses(), 0);
}

#[test]
fn power_only_polls_every_interval() {
    let settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    let mut h = Harness::new(settings, Meter::default());
    let mut request_times = Vec::new();
    let mut sent = 0;
    while h.elapsed() < Duration::from_secs(100) {
        h.step();
        let now_sent = h.meter.borrow().count("SKSENDTO");
        if now_sent > sent {
            request_times.push(h.elapsed());
            sent = now_sent;
        }
    }
    assert_eq!(
        request_times,
        vec![
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90)
        ]
    );
    assert!(h.meter.borrow().requested_epcs().iter().all(|epcs| epcs == &vec![0xe7]));

    let readings = h.readings.borrow();
    assert_eq!(readings.len(), 3);
    for reading in readings.iter() {
        assert_eq!(reading.kind, MetricKind::Power);
        assert_eq!(reading.value, Decimal::new(500, 0));
        assert_eq!(reading.unit, Unit::Watt);
        assert_eq!(reading.accuracy_decimals, 0);
    }
}

#[test]
fn requests_never_closer_than_interval() {
    let settings = BRouteSettings::new(credentials())
        .with_power(Duration::from_secs(7))
        .with_energy(Duration::from_secs(11));
    let mut h = Harness::new(settings, Meter::default());
    let mut sent = 0;
    let mut power_times = Vec::new();
    let mut energy_times = Vec::new();
    while h.elapsed() < Duration::from_secs(120) {
        h.step();
        let epcs = h.meter.borrow().requested_epcs();
        for request in epcs.iter().skip(sent) {
            match request.as_slice() {
                [0xe7] => power_times.push(h.elapsed()),
                [0xe0] => energy_times.push(h.elapsed()),
                _ => {}
            }
        }
        sent = epcs.len();
    }
    assert!(power_times.len() >= 10);
    assert!(energy_times.len() >= 5);
    for w in power_times.windows(2) {
        assert!(w[1] - w[0] >= Duration::from_secs(7), "{:?}", w);
    }
    for w in energy_times.windows(2) {
        assert!(w[1] - w[0] >= Duration::from_secs(11), "{:?}", w);
    }
}

#[test]
fn power_is_served_before_energy() {
    let settings = BRouteSettings::new(credentials())
        .with_power(Duration::from_secs(30))
        .with_energy(Duration::from_secs(30));
    let mut h = Harness::new(settings, Meter::default());
    h.run_until(31_000);
    let epcs = h.meter.borrow().requested_epcs();
    assert_eq!(epcs[0], vec![0xe7]);
    assert_eq!(epcs[1], vec![0xd3, 0xe1]);
    assert_eq!(epcs[2], vec![0xe0]);
}

#[test]
fn energy_waits_for_coefficient_and_unit() {
    let settings = BRouteSettings::new(credentials()).with_energy(Duration::from_secs(60));
    let mut h = Harness::new(settings, Meter::default());
    h.run_until(59_900);
    assert!(h.meter.borrow().requested_epcs().is_empty());
    h.run_until(61_000);
    assert_eq!(
        h.meter.borrow().requested_epcs(),
        vec![vec![0xd3, 0xe1], vec![0xe0]]
    );
    {
        let readings = h.readings.borrow();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].kind, MetricKind::Energy);
        assert_eq!(readings[0].value, Decimal::new(12345, 1));
        assert_eq!(readings[0].unit, Unit::KiloWattHour);
        assert_eq!(readings[0].accuracy_decimals, 1);
    }
    // 次は60秒後
    h.run_until(120_000);
    assert_eq!(h.meter.borrow().requested_epcs().len(), 2);
    h.run_until(121_000);
    assert_eq!(h.meter.borrow().requested_epcs().len(), 3);
    assert_eq!(h.readings.borrow().len(), 2);
}

#[test]
fn energy_without_coefficient_uses_one() {
    let settings = BRouteSettings::new(credentials()).with_energy(Duration::from_secs(60));
    let meter = Meter {
        coefficient_edt: vec![],
        ..Meter::default()
    };
    let mut h = Harness::new(settings, meter);
    h.run_until(61_000);
    assert_eq!(
        h.meter.borrow().requested_epcs(),
        vec![vec![0xd3, 0xe1], vec![0xe0]]
    );
    {
        let readings = h.readings.borrow();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, Decimal::new(12345, 1));
        assert_eq!(readings[0].accuracy_decimals, 1);
    }
    let scale = h.broute.parser().energy_scale().unwrap();
    assert_eq!(scale.coefficient.0, 1);
    h.run_until(241_000);
    assert_eq!(h.readings.borrow().len(), 4);
    assert_eq!(h.broute.fault().consecutive_misses(), 0);
    assert_eq!(h.broute.session_state(), SessionState::Joined);
    let params = h
        .meter
        .borrow()
        .requested_epcs()
        .iter()
        .filter(|epcs| epcs.contains(&0xd3))
        .count();
    assert_eq!(params, 1);
}

#[test]
fn wrong_length_power_is_counted_like_timeout() {
    let settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    let meter = Meter {
        power_edt: vec![0x01, 0xf4],
        ..Meter::default()
    };
    let mut bad = Harness::new(settings.clone(), meter);
    bad.run_until(31_000);
    assert!(bad.readings.borrow().is_empty());
    assert_eq!(bad.broute.fault().consecutive_misses(), 1);
    assert_eq!(
        bad.broute.fault().last_failure().map(|(kind, _)| kind),
        Some(FailureKind::ParseError)
    );
    assert_eq!(bad.broute.session_state(), SessionState::Joined);

    let meter = Meter {
        answers_udp: false,
        ..Meter::default()
    };
    let mut silent = Harness::new(settings, meter);
    silent.run_until(34_900);
    assert_eq!(silent.broute.fault().consecutive_misses(), 0);
    silent.run_until(35_100);
    assert!(silent.readings.borrow().is_empty());
    assert_eq!(silent.broute.fault().consecutive_misses(), 1);
    assert_eq!(
        silent.broute.fault().last_failure().map(|(kind, _)| kind),
        Some(FailureKind::Timeout)
    );
}

#[test]
fn fixed_time_notification_counts_as_alive() {
    let settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    let meter = Meter {
        answers_udp: false,
        ..Meter::default()
    };
    let mut h = Harness::new(settings, meter);
    h.run_until(36_000);
    assert_eq!(h.broute.fault().consecutive_misses(), 1);
    h.meter.borrow_mut().notify_fixed_time();
    h.run_until(37_000);
    assert_eq!(h.broute.fault().consecutive_misses(), 0);
    assert_eq!(h.broute.session_state(), SessionState::Joined);
}

#[test]
fn unacknowledged_join_rejoins_once() {
    let mut settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    settings.rejoin_count = 10;
    settings.rejoin_timeout = Duration::from_secs(120);
    let meter = Meter {
        join_acks: false,
        ..Meter::default()
    };
    let mut h = Harness::new(settings, meter);
    while h.broute.fault().consecutive_misses() < 10 {
        h.step();
        assert!(h.elapsed() < Duration::from_secs(400));
    }
    let t10 = h.elapsed();
    // 10回目の失敗と同時に再接続する
    assert!(h.broute.fault().is_degraded());
    assert_eq!(h.broute.session_state(), SessionState::Joining);
    assert_eq!(h.meter.borrow().count("SKJOIN"), 11);

    // 再接続もタイムアウトして劣化状態で待つ
    let base = t10.as_millis() as u64;
    h.run_until(base + 30_500);
    assert_eq!(h.broute.session_state(), SessionState::Degraded);
    h.run_until(base + 119_500);
    assert_eq!(h.broute.session_state(), SessionState::Degraded);
    assert_eq!(h.meter.borrow().count("SKJOIN"), 11);
    assert_eq!(h.meter.borrow().count("SKSCAN"), 1);

    h.run_until(base + 120_500);
    assert_eq!(h.broute.session_state(), SessionState::Joining);
    assert_eq!(h.meter.borrow().count("SKJOIN"), 12);
}

#[test]
fn restart_resets_module_first() {
    let mut settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    settings.rejoin_count = 1;
    settings.rejoin_timeout = Duration::from_secs(3600);
    settings.rescan_timeout = Duration::from_secs(3600);
    settings.restart_timeout = Duration::from_secs(60);
    let meter = Meter {
        join_acks: false,
        ..Meter::default()
    };
    let mut h = Harness::new(settings, meter);
    h.run_until(40_000);
    assert_eq!(h.broute.session_state(), SessionState::Degraded);
    assert_eq!(h.meter.borrow().restarts, 0);

    h.run_until(100_000);
    assert_eq!(h.meter.borrow().restarts, 1);
    let commands = h.meter.borrow().commands();
    let restart = commands.iter().position(|c| c == "<restart>").unwrap();
    assert_eq!(
        &commands[restart + 1..restart + 4],
        &["SKRESET", "SKVER", "SKSREG SFE 0"]
    );
    // 再び走査からやり直す
    assert_eq!(h.meter.borrow().count("SKSCAN"), 2);
}

#[test]
fn rescan_skips_login_commands() {
    let mut settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    settings.rejoin_count = 1;
    settings.rejoin_timeout = Duration::from_secs(3600);
    settings.rescan_timeout = Duration::from_secs(60);
    settings.restart_timeout = Duration::from_secs(3600);
    let meter = Meter {
        join_acks: false,
        ..Meter::default()
    };
    let mut h = Harness::new(settings, meter);
    h.run_until(40_000);
    assert_eq!(h.broute.session_state(), SessionState::Degraded);
    h.run_until(85_000);
    assert_eq!(h.broute.session_state(), SessionState::Degraded);
    assert_eq!(h.meter.borrow().count("SKSCAN"), 1);

    h.run_until(95_000);
    assert_eq!(h.broute.session_state(), SessionState::Joining);
    let meter = h.meter.borrow();
    let commands = meter.commands();
    let rescan = commands.iter().rposition(|c| c.starts_with("SKSCAN")).unwrap();
    assert!(rescan > 0);
    assert_eq!(
        &commands[rescan..],
        &[
            "SKSCAN 2 FFFFFFFF 6",
            "SKSREG S02 3B",
            "SKSREG S03 ABCD",
            "SKJOIN FE80:0000:0000:0000:021D:1290:1234:5678",
        ]
    );
    assert_eq!(meter.count("SKVER"), 1);
    assert_eq!(meter.count("SKSETPWD"), 1);
    assert_eq!(meter.count("SKSCAN"), 2);
    assert_eq!(meter.restarts, 0);
}

#[test]
fn instances_are_isolated() {
    let settings = BRouteSettings::new(credentials()).with_power(Duration::from_secs(30));
    let mut good = Harness::new(settings.clone(), Meter::default());
    let mut stuck = Harness::new(
        settings,
        Meter {
            join_acks: false,
            ..Meter::default()
        },
    );
    for _ in 0..320 {
        good.step();
        stuck.step();
    }
    assert_eq!(good.broute.session_state(), SessionState::Joined);
    assert_eq!(good.readings.borrow().len(), 1);
    assert_eq!(good.broute.fault().consecutive_misses(), 0);

    assert_eq!(stuck.broute.session_state(), SessionState::Joining);
    assert!(stuck.readings.borrow().is_empty());
    assert_eq!(stuck.broute.fault().consecutive_misses(), 1);
    assert_eq!(stuck.meter.borrow().count("SKSENDTO"), 0);
}
