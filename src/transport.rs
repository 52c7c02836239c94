// シリアル通信 送受信
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// 行単位で読み書きする通信路
pub trait Transport {
    /// バイト列を書き込む(終端はコマンド側が付ける)
    fn write_line(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// 受信済みの1行を取り出す。まだ行が揃っていなければ None
    fn read_available_line(&mut self) -> io::Result<Option<String>>;

    /// 送受信バッファを捨てて通信路を初期状態に戻す
    fn restart(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 受信バッファから1行取り出す
///
/// CR で行が終わる。LF は読み飛ばす。空行は捨てる。
pub fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let pos = buffer.iter().position(|&b| b == b'\r')?;
        let line = buffer
            .drain(..=pos)
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect::<Vec<u8>>();
        if !line.is_empty() {
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// シリアルポート
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    buffer: Vec<u8>,
}

impl SerialTransport {
    pub const BAUD_RATE: u32 = 115200;

    /// シリアルポートを開く
    pub fn open(port_name: &str) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, Self::BAUD_RATE)
            .stop_bits(StopBits::One)
            .data_bits(DataBits::Eight)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(Self {
            port,
            buffer: Vec::with_capacity(1024),
        })
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_available_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = take_line(&mut self.buffer) {
            return Ok(Some(line));
        }
        let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available > 0 {
            let mut chunk = vec![0u8; available];
            match self.port.read(&mut chunk) {
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {} // タイムアウトエラーは無視する
                Err(e) => return Err(e),
            }
        }
        Ok(take_line(&mut self.buffer))
    }

    fn restart(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

#[test]
fn test_take_line() {
    let mut buffer = b"OK\r\n\r\nEVENT 22 FE80:0000:0000:0000:0000:0000:0000:0001\r\nERX".to_vec();
    assert_eq!(take_line(&mut buffer), Some("OK".to_owned()));
    assert_eq!(
        take_line(&mut buffer),
        Some("EVENT 22 FE80:0000:0000:0000:0000:0000:0000:0001".to_owned())
    );
    // 行末がまだ届いていない
    assert_eq!(take_line(&mut buffer), None);
    assert_eq!(buffer, b"\nERX".to_vec());
    buffer.extend_from_slice(b"UDP\r\n");
    assert_eq!(take_line(&mut buffer), Some("ERXUDP".to_owned()));
    assert!(buffer.starts_with(b"\n"));
}

#[test]
fn test_take_line_keeps_indent() {
    let mut buffer = b"EPANDESC\r\n  Channel:21\r\n".to_vec();
    assert_eq!(take_line(&mut buffer), Some("EPANDESC".to_owned()));
    assert_eq!(take_line(&mut buffer), Some("  Channel:21".to_owned()));
}
