//! 패킷 정의
//!
//! - Packet: 인자 맵 + 본문 조각을 길이 헤더가 붙은 와이어 문자열로 인코딩
//! - PacketDecoder: 스트림에서 한 바이트씩 받아 선언된 길이만큼 모이면 완료
//!
//! 와이어 형식: `<페이로드 바이트 수>:<필드>*[|<본문>]`
//! - 스칼라 필드 `KEY=value;` (`\`와 `;`는 `\`로 이스케이프)
//! - 배열 필드 `KEY#1,2,3;`
//!
//! 경계는 길이로만 결정되므로 본문에 개행이나 구분자가 있어도 안전함

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result, MAX_PACKET_LEN};

/// 청크 시퀀스 번호
pub type SequenceNum = u32;

const LENGTH_TERMINATOR: u8 = b':';
const SCALAR_SEPARATOR: char = '=';
const ARRAY_SEPARATOR: char = '#';
const ARRAY_DELIMITER: char = ',';
const FIELD_TERMINATOR: char = ';';
const BODY_MARKER: char = '|';
const ESCAPE: char = '\\';

/// 길이 헤더 최대 자릿수
const MAX_INDICATOR_DIGITS: usize = 20;

/// 패킷 인자 키 (닫힌 집합)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArgKey {
    RequestType,
    Completed,
    TotalPackets,
    SequenceNum,
    TotalPacketsMissing,
    MissingPacketNums,
}

impl ArgKey {
    pub const ALL: [ArgKey; 6] = [
        ArgKey::RequestType,
        ArgKey::Completed,
        ArgKey::TotalPackets,
        ArgKey::SequenceNum,
        ArgKey::TotalPacketsMissing,
        ArgKey::MissingPacketNums,
    ];

    /// 와이어 상의 키 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgKey::RequestType => "REQUEST_TYPE",
            ArgKey::Completed => "COMPLETED",
            ArgKey::TotalPackets => "TOTAL_PACKETS",
            ArgKey::SequenceNum => "SEQUENCE_NUM",
            ArgKey::TotalPacketsMissing => "TOTAL_PACKETS_MISSING",
            ArgKey::MissingPacketNums => "MISSING_PACKET_NUMS",
        }
    }

    /// 배열 값을 갖는 키인지
    pub fn is_array(&self) -> bool {
        matches!(self, ArgKey::MissingPacketNums)
    }
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArgKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ArgKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| Error::malformed(format!("알 수 없는 키: '{s}'")))
    }
}

/// 인자 값 (스칼라 텍스트 또는 정수 배열)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Text(String),
    IntArray(Vec<SequenceNum>),
}

impl ArgValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(text) => Some(text),
            ArgValue::IntArray(_) => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[SequenceNum]> {
        match self {
            ArgValue::Text(_) => None,
            ArgValue::IntArray(values) => Some(values),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

impl From<Vec<SequenceNum>> for ArgValue {
    fn from(values: Vec<SequenceNum>) -> Self {
        ArgValue::IntArray(values)
    }
}

/// 송신 패킷 (인코더)
///
/// 인자는 생성 후에도 자유롭게 바꿀 수 있고, 인코딩은 항상 현재 상태에서 다시 만듦
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    args: BTreeMap<ArgKey, ArgValue>,
    body: Option<String>,
}

impl Packet {
    /// 빈 패킷 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 스칼라 인자 맵과 배열 인자 맵으로 패킷 생성
    pub fn with_args<S, A>(scalars: S, arrays: A) -> Self
    where
        S: IntoIterator<Item = (ArgKey, String)>,
        A: IntoIterator<Item = (ArgKey, Vec<SequenceNum>)>,
    {
        let mut args: BTreeMap<ArgKey, ArgValue> = scalars
            .into_iter()
            .map(|(key, value)| (key, ArgValue::Text(value)))
            .collect();
        args.extend(
            arrays
                .into_iter()
                .map(|(key, values)| (key, ArgValue::IntArray(values))),
        );

        Self { args, body: None }
    }

    /// 스칼라 인자 설정
    pub fn set_arg(&mut self, key: ArgKey, value: impl Into<String>) -> &mut Self {
        self.args.insert(key, ArgValue::Text(value.into()));
        self
    }

    /// 배열 인자 설정
    pub fn set_int_array_arg(
        &mut self,
        key: ArgKey,
        values: impl IntoIterator<Item = SequenceNum>,
    ) -> &mut Self {
        self.args
            .insert(key, ArgValue::IntArray(values.into_iter().collect()));
        self
    }

    /// 스칼라 인자를 설정한 사본
    pub fn with_arg(mut self, key: ArgKey, value: impl Into<String>) -> Self {
        self.set_arg(key, value);
        self
    }

    pub fn remove_arg(&mut self, key: ArgKey) -> Option<ArgValue> {
        self.args.remove(&key)
    }

    pub fn arg(&self, key: ArgKey) -> Option<&ArgValue> {
        self.args.get(&key)
    }

    pub fn contains_arg(&self, key: ArgKey) -> bool {
        self.args.contains_key(&key)
    }

    /// 본문 조각 설정 (길이 계산 영역 안에 포함됨)
    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// 길이 헤더를 제외한 페이로드
    pub fn payload(&self) -> String {
        let mut out = String::new();

        for (key, value) in &self.args {
            out.push_str(key.as_str());
            match value {
                ArgValue::Text(text) => {
                    out.push(SCALAR_SEPARATOR);
                    escape_into(&mut out, text);
                }
                ArgValue::IntArray(values) => {
                    out.push(ARRAY_SEPARATOR);
                    for (idx, value) in values.iter().enumerate() {
                        if idx > 0 {
                            out.push(ARRAY_DELIMITER);
                        }
                        out.push_str(&value.to_string());
                    }
                }
            }
            out.push(FIELD_TERMINATOR);
        }

        if let Some(body) = &self.body {
            out.push(BODY_MARKER);
            out.push_str(body);
        }

        out
    }

    /// 와이어 바이트로 인코딩
    pub fn encode(&self) -> Bytes {
        let payload = self.payload();
        let header = payload.len().to_string();

        let mut buf = BytesMut::with_capacity(header.len() + 1 + payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_u8(LENGTH_TERMINATOR);
        buf.put_slice(payload.as_bytes());
        buf.freeze()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = self.payload();
        write!(f, "{}:{}", payload.len(), payload)
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == ESCAPE || c == FIELD_TERMINATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// 디코딩된 필드 (배열 원소는 조회 시점에 정수 변환)
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Scalar(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Parsed {
    fields: BTreeMap<ArgKey, Field>,
    body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// 길이 헤더 읽는 중
    Indicator { declared: usize, digits: usize },
    /// 페이로드 읽는 중
    Payload { declared: usize },
    /// 헤더 손상, 더 이상 해석 불가
    Corrupt,
}

/// 수신 패킷 (디코더)
///
/// 첫 바이트로 생성하고 `is_complete()`가 참이 될 때까지 한 바이트씩 `push`.
/// `push`는 절대 실패하지 않고, 해석은 완료 후 조회 메서드에서만 함
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    buf: BytesMut,
    header_len: usize,
    state: DecodeState,
    max_len: usize,
    parsed: Option<std::result::Result<Parsed, String>>,
}

impl PacketDecoder {
    /// 첫 바이트로 디코더 생성
    pub fn new(first: u8) -> Self {
        Self::with_limit(first, MAX_PACKET_LEN)
    }

    /// 최대 페이로드 길이를 지정해 디코더 생성
    pub fn with_limit(first: u8, max_len: usize) -> Self {
        let mut decoder = Self {
            buf: BytesMut::with_capacity(64),
            header_len: 0,
            state: DecodeState::Indicator {
                declared: 0,
                digits: 0,
            },
            max_len,
            parsed: None,
        };
        decoder.push(first);
        decoder
    }

    /// 한 바이트 추가
    pub fn push(&mut self, byte: u8) {
        self.buf.put_u8(byte);

        let state = self.state;
        match state {
            DecodeState::Indicator { declared, digits } => {
                if byte == LENGTH_TERMINATOR && digits > 0 {
                    self.header_len = self.buf.len();
                    self.state = DecodeState::Payload { declared };
                    self.try_finish();
                } else if byte.is_ascii_digit() && digits < MAX_INDICATOR_DIGITS {
                    let next = declared
                        .checked_mul(10)
                        .and_then(|d| d.checked_add(usize::from(byte - b'0')));
                    match next {
                        Some(n) if n <= self.max_len => {
                            self.state = DecodeState::Indicator {
                                declared: n,
                                digits: digits + 1,
                            };
                        }
                        _ => self.corrupt(format!("선언 길이가 최대 {}바이트 초과", self.max_len)),
                    }
                } else {
                    self.corrupt(format!("길이 헤더에 잘못된 바이트 0x{byte:02X}"));
                }
            }
            DecodeState::Payload { .. } => self.try_finish(),
            DecodeState::Corrupt => {}
        }
    }

    /// 버퍼 앞부분에서 패킷 하나 디코딩
    ///
    /// 완료된 디코더와 사용한 바이트 수 반환, 바이트가 모자라면 None
    pub fn from_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
        let (&first, rest) = bytes.split_first()?;
        let mut decoder = Self::new(first);
        let mut consumed = 1;

        for &byte in rest {
            if decoder.is_complete() {
                break;
            }
            decoder.push(byte);
            consumed += 1;
        }

        decoder.is_complete().then_some((decoder, consumed))
    }

    /// 여러 바이트 추가
    pub fn extend(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    fn corrupt(&mut self, reason: String) {
        self.state = DecodeState::Corrupt;
        self.parsed = Some(Err(reason));
    }

    fn try_finish(&mut self) {
        self.parsed = if self.is_complete() {
            Some(parse_payload(self.payload()))
        } else {
            None
        };
    }

    /// 선언 길이와 누적 길이가 정확히 같으면 완료 (헤더 손상 시에도 완료로 보고)
    pub fn is_complete(&self) -> bool {
        match self.state {
            DecodeState::Payload { declared } => self.payload().len() == declared,
            DecodeState::Corrupt => true,
            DecodeState::Indicator { .. } => false,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.state == DecodeState::Corrupt
    }

    /// 헤더 손상 사유
    pub fn corruption(&self) -> Option<&str> {
        match (self.state, &self.parsed) {
            (DecodeState::Corrupt, Some(Err(reason))) => Some(reason.as_str()),
            _ => None,
        }
    }

    /// 헤더에 선언된 페이로드 길이
    pub fn declared_len(&self) -> Option<usize> {
        match self.state {
            DecodeState::Payload { declared } => Some(declared),
            _ => None,
        }
    }

    /// 지금까지 받은 원본 (헤더 포함)
    pub fn packet_string(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// 헤더를 제외한 페이로드 바이트
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    /// 수신한 전체 바이트 수
    pub fn wire_len(&self) -> usize {
        self.buf.len()
    }

    fn parsed(&self) -> Result<&Parsed> {
        match &self.parsed {
            Some(Ok(parsed)) => Ok(parsed),
            Some(Err(reason)) => Err(Error::malformed(reason.clone())),
            None => Err(Error::malformed("패킷 미완성")),
        }
    }

    fn field(&self, key: ArgKey) -> Result<&Field> {
        self.parsed()?
            .fields
            .get(&key)
            .ok_or(Error::MissingArg { key })
    }

    /// 인자 존재 여부
    pub fn contains_arg(&self, key: ArgKey) -> bool {
        self.parsed()
            .map(|parsed| parsed.fields.contains_key(&key))
            .unwrap_or(false)
    }

    /// 스칼라 인자 조회
    pub fn get_arg(&self, key: ArgKey) -> Result<&str> {
        match self.field(key)? {
            Field::Scalar(value) => Ok(value),
            Field::List(_) => Err(Error::malformed(format!("{key}는 배열 인자"))),
        }
    }

    /// 스칼라 인자를 정수로 조회
    pub fn get_u32_arg(&self, key: ArgKey) -> Result<u32> {
        let value = self.get_arg(key)?;
        value
            .trim()
            .parse()
            .map_err(|_| Error::malformed(format!("{key} 값이 정수 아님: '{value}'")))
    }

    /// 배열 인자 조회
    pub fn get_int_array_arg(&self, key: ArgKey) -> Result<Vec<SequenceNum>> {
        match self.field(key)? {
            Field::Scalar(_) => Err(Error::malformed(format!("{key}는 스칼라 인자"))),
            Field::List(items) => items
                .iter()
                .map(|item| {
                    item.trim().parse().map_err(|_| {
                        Error::malformed(format!("{key} 원소가 정수 아님: '{item}'"))
                    })
                })
                .collect(),
        }
    }

    /// 본문 조각
    pub fn body(&self) -> Option<&str> {
        self.parsed().ok().and_then(|parsed| parsed.body.as_deref())
    }
}

fn parse_payload(payload: &[u8]) -> std::result::Result<Parsed, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("UTF-8 아님: {e}"))?;

    let mut fields = BTreeMap::new();
    let mut rest = text;

    loop {
        if rest.is_empty() {
            return Ok(Parsed { fields, body: None });
        }
        if let Some(body) = rest.strip_prefix(BODY_MARKER) {
            return Ok(Parsed {
                fields,
                body: Some(body.to_owned()),
            });
        }

        let sep = rest
            .find(|c: char| c == SCALAR_SEPARATOR || c == ARRAY_SEPARATOR)
            .ok_or_else(|| "키 구분자 없음".to_string())?;
        let key: ArgKey = rest[..sep].parse().map_err(|e: Error| e.to_string())?;
        let is_array = rest[sep..].starts_with(ARRAY_SEPARATOR);
        let (raw, remainder) = split_value(&rest[sep + 1..])?;

        let field = if !is_array {
            Field::Scalar(raw)
        } else if raw.is_empty() {
            Field::List(Vec::new())
        } else {
            Field::List(raw.split(ARRAY_DELIMITER).map(str::to_owned).collect())
        };

        if fields.insert(key, field).is_some() {
            return Err(format!("중복 키: {key}"));
        }
        rest = remainder;
    }
}

/// 종결자까지 값을 읽고 이스케이프 해제, 남은 입력 반환
fn split_value(input: &str) -> std::result::Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((idx, c)) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => return Err("이스케이프 뒤 문자 없음".into()),
            },
            FIELD_TERMINATOR => return Ok((value, &input[idx + 1..])),
            _ => value.push(c),
        }
    }

    Err("필드 종결자 없음".into())
}
