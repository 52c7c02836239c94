// SKSTACK/IPのコマンド
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::EchonetliteFrame;
use crate::skstack::authn::{Id, Password};
use crate::skstack::Erxudp;
use std::fmt;
use std::net::Ipv6Addr;

/// IPv6アドレスをSKSTACKの表記(FE80:0000:...)にする
pub fn ipv6_text(addr: &Ipv6Addr) -> String {
    addr.segments().map(|n| format!("{:04X}", n)).join(":")
}

#[derive(Clone, PartialEq, Eq)]
pub enum SkCommand {
    /// SKRESET リセット
    Reset,
    /// SKVER バージョン
    Version,
    /// SKSREG 仮想レジスタの設定
    SetRegister { register: u8, value: String },
    /// ROPT 受信データ表示形式の読み出し(BP35A1)
    ReadOption,
    /// WOPT 受信データ表示形式の書き込み(BP35A1)
    WriteOption(u8),
    /// SKSETPWD パスワードを登録する
    SetPassword(Password),
    /// SKSETRBID IDを登録する
    SetRouteBId(Id),
    /// SKSCAN アクティブスキャン
    ActiveScan { duration: u8 },
    /// SKJOIN PANA認証開始
    Join(Ipv6Addr),
    /// SKSENDTO UDP送信
    SendTo { destination: Ipv6Addr, payload: Vec<u8> },
}

impl SkCommand {
    /// コマンドのエコーバックを無効にする。
    pub fn disable_echo_back() -> Self {
        Self::SetRegister {
            register: 0xfe,
            value: "0".to_owned(),
        }
    }

    /// 自端末の論理チャンネル番号を設定する
    pub fn set_channel(channel: u8) -> Self {
        Self::SetRegister {
            register: 0x02,
            value: format!("{:02X}", channel),
        }
    }

    /// 自端末のPAN IDを設定する
    pub fn set_pan_id(pan_id: u16) -> Self {
        Self::SetRegister {
            register: 0x03,
            value: format!("{:04X}", pan_id),
        }
    }

    /// Echonetliteメッセージ送信
    pub fn send_echonetlite(
        destination: Ipv6Addr,
        frame: &EchonetliteFrame,
    ) -> Result<Self, bincode::error::EncodeError> {
        Ok(Self::SendTo {
            destination,
            payload: frame.encode()?,
        })
    }

    /// シリアルポートに書き込むバイト列
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            // ROPT, WOPT はCRのみで終端する
            Self::ReadOption => b"ROPT\r".to_vec(),
            Self::WriteOption(mode) => format!("WOPT {:02X}\r", mode).into_bytes(),
            // SKSENDTO は改行なしでバイナリデータが続く
            Self::SendTo {
                destination,
                payload,
            } => {
                let sksendto = format!(
                    "SKSENDTO 1 {} {:04X} 1 {:04X} ",
                    ipv6_text(destination),
                    Erxudp::ECHONETLITE_PORT,
                    payload.len(),
                );
                [sksendto.as_bytes(), payload].concat()
            }
            _ => format!("{}\r\n", self.text()).into_bytes(),
        }
    }

    // コマンド文字列
    fn text(&self) -> String {
        match self {
            Self::Reset => "SKRESET".to_owned(),
            Self::Version => "SKVER".to_owned(),
            Self::SetRegister { register, value } => {
                format!("SKSREG S{:02X} {}", register, value)
            }
            Self::ReadOption => "ROPT".to_owned(),
            Self::WriteOption(mode) => format!("WOPT {:02X}", mode),
            Self::SetPassword(password) => {
                format!("SKSETPWD {:02X} {}", password.len(), password.expose())
            }
            Self::SetRouteBId(id) => format!("SKSETRBID {}", id),
            Self::ActiveScan { duration } => format!("SKSCAN 2 FFFFFFFF {:X}", duration),
            Self::Join(address) => format!("SKJOIN {}", ipv6_text(address)),
            Self::SendTo {
                destination,
                payload,
            } => format!(
                "SKSENDTO 1 {} {:04X} 1 {:04X} <{} bytes>",
                ipv6_text(destination),
                Erxudp::ECHONETLITE_PORT,
                payload.len(),
                payload.len()
            ),
        }
    }
}

// パスワードは伏せる
impl fmt::Debug for SkCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SetPassword(password) => {
                write!(f, "SKSETPWD {:02X} {}", password.len(), "#".repeat(password.len()))
            }
            _ => write!(f, "{}", self.text()),
        }
    }
}

#[test]
fn test_login_commands() {
    let password: Password = "secret".parse().unwrap();
    let id: Id = "0123456789ABCDEF0123456789ABCDEF".parse().unwrap();
    assert_eq!(SkCommand::Version.to_bytes(), b"SKVER\r\n");
    assert_eq!(SkCommand::Reset.to_bytes(), b"SKRESET\r\n");
    assert_eq!(SkCommand::disable_echo_back().to_bytes(), b"SKSREG SFE 0\r\n");
    assert_eq!(SkCommand::ReadOption.to_bytes(), b"ROPT\r");
    assert_eq!(SkCommand::WriteOption(1).to_bytes(), b"WOPT 01\r");
    assert_eq!(
        SkCommand::SetPassword(password.clone()).to_bytes(),
        b"SKSETPWD 06 secret\r\n"
    );
    assert_eq!(
        format!("{:?}", SkCommand::SetPassword(password)),
        "SKSETPWD 06 ######"
    );
    assert_eq!(
        SkCommand::SetRouteBId(id).to_bytes(),
        b"SKSETRBID 0123456789ABCDEF0123456789ABCDEF\r\n"
    );
    assert_eq!(
        SkCommand::ActiveScan { duration: 6 }.to_bytes(),
        b"SKSCAN 2 FFFFFFFF 6\r\n"
    );
    assert_eq!(SkCommand::set_channel(0x3b).to_bytes(), b"SKSREG S02 3B\r\n");
    assert_eq!(SkCommand::set_pan_id(0xabcd).to_bytes(), b"SKSREG S03 ABCD\r\n");
}

#[test]
fn test_join_and_sendto() {
    let address: Ipv6Addr = "FE80::021D:1290:1234:5678".parse().unwrap();
    assert_eq!(
        SkCommand::Join(address).to_bytes(),
        b"SKJOIN FE80:0000:0000:0000:021D:1290:1234:5678\r\n"
    );
    let sendto = SkCommand::SendTo {
        destination: address,
        payload: vec![0x10, 0x81],
    };
    let mut expected = b"SKSENDTO 1 FE80:0000:0000:0000:021D:1290:1234:5678 0E1A 1 0002 ".to_vec();
    expected.extend_from_slice(&[0x10, 0x81]);
    assert_eq!(sendto.to_bytes(), expected);
}
