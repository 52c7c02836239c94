// スマートメーターから瞬時電力と積算電力量を収集する。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use broute::{BRoute, BRouteSettings, ConfigError, Publish, Reading, SerialTransport};
use chrono::Utc;
use chrono_tz::Asia;
use clap::Parser;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::result;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

#[derive(Debug, Error)]
pub enum DaqDaemonError {
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"serial port "{0}""#)]
    SerialPort(#[from] serialport::Error),

    #[error(r#"settings "{0}""#)]
    Config(#[from] ConfigError),
}

/// スマートメーターから計測値を収集する
#[derive(Parser, Debug)]
#[command(name = "broute_daqd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 設定ファイル
    #[arg(short = 'C', long, env = "BROUTE_CONFIG", default_value = "broute.toml")]
    config: PathBuf,

    /// シリアルデバイス名
    #[arg(short = 'D', long, env = "SERIAL_DEVICE", default_value = "/dev/ttyUSB0")]
    device: String,

    /// 処理間隔(ミリ秒)
    #[arg(long, default_value_t = 100)]
    tick_millis: u64,

    /// 計測値をJSONで標準出力に書く
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ReadingRecord {
    kind: String,
    value: String,
    unit: String,
    recorded_at: String,
}

/// 計測値をログに出す
struct LogPublisher {
    json: bool,
}

impl Publish for LogPublisher {
    fn publish(&mut self, reading: &Reading) {
        if !self.json {
            return;
        }
        let record = ReadingRecord {
            kind: reading.kind.to_string(),
            value: reading.value.round_dp(reading.accuracy_decimals).to_string(),
            unit: reading.unit.to_string(),
            recorded_at: Utc::now().with_timezone(&Asia::Tokyo).to_rfc3339(),
        };
        match serde_json::to_string(&record) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("{}", e),
        }
    }
}

/// スマートメーターからデーターを収集する
async fn exec_data_acquisition(cli: &Cli) -> result::Result<(), DaqDaemonError> {
    let settings = BRouteSettings::load(&cli.config)?;
    let transport = SerialTransport::open(&cli.device)?;
    let publisher = LogPublisher { json: cli.json };
    let mut broute = BRoute::new(settings, transport, publisher, Instant::now());

    broute.setup(Instant::now());
    let mut interval = tokio::time::interval(Duration::from_millis(cli.tick_millis.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => broute.tick(Instant::now()),
            v = tokio::signal::ctrl_c() => {
                v?;
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}

// SKSETPWD の後のパスワードを伏せる
fn mask_password(line: &str) -> String {
    const PATTERN: &str = "SKSETPWD ";
    let Some(pos) = line.find(PATTERN) else {
        return line.to_owned();
    };
    let (head, rest) = line.split_at(pos + PATTERN.len());
    let Some((len_hex, tail)) = rest.split_once(' ') else {
        return line.to_owned();
    };
    let Ok(len) = usize::from_str_radix(len_hex, 16) else {
        return line.to_owned();
    };
    let masked = "#".repeat(tail.chars().take(len).count());
    let remain = tail.chars().skip(len).collect::<String>();
    format!("{}{} {}{}", head, len_hex, masked, remain)
}

/// SKSETPWD XX 以降のパスワードをマスクするフォーマッタ
struct MaskingRouteBPasswordFormatter;

impl<S, N> FormatEvent<S, N> for MaskingRouteBPasswordFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // まず標準フォーマットをバッファに書き出す
        let mut buf = String::new();
        {
            let temp_writer = fmt::format::Writer::new(&mut buf);
            fmt::format::Format::default()
                .with_timer(fmt::time::LocalTime::rfc_3339())
                .with_ansi(false)
                .format_event(ctx, temp_writer, event)?;
        }
        writer.write_str(&mask_password(&buf))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let app_info = format!("{} / {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // tracingの設定
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // systemd-journaldに接続
    match tracing_journald::layer() {
        // journaldにログ出力する
        Ok(journald_layer) => registry.with(journald_layer).init(),
        // journaldが使えないので、標準エラー出力にログ出力する
        Err(e) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .event_format(MaskingRouteBPasswordFormatter),
                )
                .init();
            tracing::warn!("couldn't connect to journald: {}", e)
        }
    }

    // サービスを開始する
    tracing::info!("{app_info} started.");
    let reason = loop {
        break match exec_data_acquisition(&cli).await {
            Ok(()) => {
                tracing::info!("{app_info} stopped.");
                return ExitCode::SUCCESS;
            }
            Err(e @ DaqDaemonError::SerialPort(_)) => {
                tracing::error!("{e}");
                tokio::time::sleep(Duration::from_secs(5)).await; // 再始動まで少々クールダウン時間をもつ
                continue; // 再始動
            }
            Err(e @ DaqDaemonError::Io(_)) => e.to_string(),
            Err(e @ DaqDaemonError::Config(_)) => e.to_string(),
        };
    };

    // ここに到達するのは異常終了しかありえない
    tracing::error!("{app_info} aborted, reason: {reason}");
    ExitCode::FAILURE
}

#[test]
fn test_mask_password() {
    assert_eq!(
        mask_password("TRACE Tx->: SKSETPWD 06 secret"),
        "TRACE Tx->: SKSETPWD 06 ######"
    );
    assert_eq!(
        mask_password("SKSETPWD C 0123456789AB\n"),
        "SKSETPWD C ############\n"
    );
    assert_eq!(mask_password("SKVER"), "SKVER");
    assert_eq!(mask_password("SKSETPWD ZZ abc"), "SKSETPWD ZZ abc");
}
