// ルートB認証情報
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("IDは32文字固定長です (入力 {0} 文字)")]
    IdLength(usize),
    #[error("PASSWORDは1～32文字です (入力 {0} 文字)")]
    PasswordLength(usize),
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// 認証情報
pub struct Credentials {
    pub id: Id,
    pub password: Password,
}

impl Credentials {
    pub fn new(id: &str, password: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            id: id.parse()?,
            password: password.parse()?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// ID
pub struct Id([char; 32]);

impl std::str::FromStr for Id {
    type Err = CredentialError;
    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars = s.chars().collect::<Vec<char>>();
        let len = chars.len();
        chars
            .try_into()
            .map(Self)
            .map_err(|_| CredentialError::IdLength(len))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.iter().collect::<String>())
    }
}

#[derive(Clone, PartialEq, Eq)]
/// パスワード
pub struct Password(String);

impl Password {
    pub const MAX_LENGTH: usize = 32;

    /// 文字数
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SKSETPWD コマンドに渡す文字列
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Password {
    type Err = CredentialError;
    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.chars().count() {
            1..=Self::MAX_LENGTH => Ok(Self(s.to_owned())),
            len => Err(CredentialError::PasswordLength(len)),
        }
    }
}

// ログに出さない
impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Password(\"{}\")", "#".repeat(self.len()))
    }
}

#[test]
fn test_id() {
    let id: Id = "12345678901234567890123456789012".parse().unwrap();
    assert_eq!(id.to_string(), "12345678901234567890123456789012");
    assert_eq!(
        "1234567890123456789012345678901".parse::<Id>(),
        Err(CredentialError::IdLength(31))
    );
    assert_eq!(
        "123456789012345678901234567890123".parse::<Id>(),
        Err(CredentialError::IdLength(33))
    );
}

#[test]
fn test_password() {
    let password: Password = "secret".parse().unwrap();
    assert_eq!(password.expose(), "secret");
    assert_eq!(password.len(), 6);
    assert_eq!(format!("{:?}", password), "Password(\"######\")");
    assert_eq!("".parse::<Password>(), Err(CredentialError::PasswordLength(0)));
    assert!("A".repeat(32).parse::<Password>().is_ok());
    assert_eq!(
        "A".repeat(33).parse::<Password>(),
        Err(CredentialError::PasswordLength(33))
    );
}
