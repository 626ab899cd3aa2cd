use std::io;

use nom::{
    branch::alt,
    bytes::streaming::{tag, take, take_until},
    combinator::{map, map_opt, map_res},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use crate::misc::MaybeUtf8;

/// The three-digit SMTP reply code (RFC 5321 section 4.2).
#[cfg_attr(test, derive(PartialEq))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ReplyCode {
    code: u16,
}

#[cfg_attr(test, allow(dead_code))]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode { code: 211 };
    pub const HELP_MESSAGE: ReplyCode = ReplyCode { code: 214 };
    pub const SERVICE_READY: ReplyCode = ReplyCode { code: 220 };
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode { code: 221 };
    pub const OKAY: ReplyCode = ReplyCode { code: 250 };
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode { code: 251 };
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode { code: 252 };
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode { code: 354 };
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode { code: 421 };
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode { code: 450 };
    pub const LOCAL_ERROR: ReplyCode = ReplyCode { code: 451 };
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode { code: 452 };
    pub const UNABLE_TO_ACCEPT_PARAMETERS: ReplyCode = ReplyCode { code: 455 };
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode { code: 500 };
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode { code: 501 };
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 502 };
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode { code: 503 };
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 504 };
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode { code: 550 };
    pub const POLICY_REASON: ReplyCode = ReplyCode { code: 550 };
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode { code: 551 };
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode { code: 552 };
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode { code: 553 };
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode { code: 554 };
    pub const MAIL_OR_RCPT_PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 555 };

    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000);
        ReplyCode { code }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The first digit of the reply, which tells whether the command was
    /// accepted, needs more data, or was refused.
    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            1 => ReplyCodeKind::PositivePreliminary,
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// The second digit of the reply, which tells what the reply is about.
    pub fn category(&self) -> ReplyCodeCategory {
        match (self.code / 10) % 10 {
            0 => ReplyCodeCategory::Syntax,
            1 => ReplyCodeCategory::Information,
            2 => ReplyCodeCategory::Connections,
            5 => ReplyCodeCategory::MailSystem,
            n => ReplyCodeCategory::Unspecified(n as u8),
        }
    }

    fn parse(buf: &[u8]) -> IResult<&[u8], ReplyCode> {
        map_opt(take(3usize), |d: &[u8]| {
            if !d.iter().all(u8::is_ascii_digit) {
                return None;
            }
            let code = (d[0] - b'0') as u16 * 100 + (d[1] - b'0') as u16 * 10 + (d[2] - b'0') as u16;
            Some(ReplyCode::custom(code))
        })(buf)
    }

    fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let d = [
            b'0' + (self.code / 100) as u8,
            b'0' + ((self.code / 10) % 10) as u8,
            b'0' + (self.code % 10) as u8,
        ];
        w.write_all(&d)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    MailSystem,
    /// Some digit that RFC 5321 does not attach a specific meaning to.
    Unspecified(u8),
}

/// An enhanced status code as defined by RFC 3463, of the shape
/// `class.subject.detail`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnhancedReplyCode<S = String> {
    pub class: EnhancedReplyCodeClass,
    pub subject: EnhancedReplyCodeSubject,
    pub detail: u16,
    pub text: Option<S>,
}

impl<'a, S> From<EnhancedReplyCode<&'a str>> for EnhancedReplyCode<S>
where
    S: From<&'a str>,
{
    fn from(e: EnhancedReplyCode<&'a str>) -> EnhancedReplyCode<S> {
        EnhancedReplyCode {
            class: e.class,
            subject: e.subject,
            detail: e.detail,
            text: e.text.map(S::from),
        }
    }
}

#[cfg_attr(test, allow(dead_code))]
impl EnhancedReplyCode<&'static str> {
    pub const SUCCESS_UNDEFINED: EnhancedReplyCode<&'static str> = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
        text: None,
    };
    pub const SUCCESS_DEST_VALID: EnhancedReplyCode<&'static str> = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 5,
        text: None,
    };
    pub const TRANSIENT_UNDEFINED: EnhancedReplyCode<&'static str> = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
        text: None,
    };
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: EnhancedReplyCode<&'static str> =
        EnhancedReplyCode {
            class: EnhancedReplyCodeClass::TransientFailure,
            subject: EnhancedReplyCodeSubject::MailSystem,
            detail: 5,
            text: None,
        };
    pub const PERMANENT_UNDEFINED: EnhancedReplyCode<&'static str> = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
        text: None,
    };
    pub const PERMANENT_INVALID_COMMAND: EnhancedReplyCode<&'static str> = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Protocol,
        detail: 1,
        text: None,
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeClass {
    Success,
    TransientFailure,
    PermanentFailure,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    Network,
    Protocol,
    Content,
    Policy,
}

impl EnhancedReplyCodeClass {
    fn digit(&self) -> u8 {
        match self {
            EnhancedReplyCodeClass::Success => 2,
            EnhancedReplyCodeClass::TransientFailure => 4,
            EnhancedReplyCodeClass::PermanentFailure => 5,
        }
    }

    fn from_digit(d: u8) -> Option<EnhancedReplyCodeClass> {
        match d {
            2 => Some(EnhancedReplyCodeClass::Success),
            4 => Some(EnhancedReplyCodeClass::TransientFailure),
            5 => Some(EnhancedReplyCodeClass::PermanentFailure),
            _ => None,
        }
    }
}

impl EnhancedReplyCodeSubject {
    fn digit(&self) -> u8 {
        match self {
            EnhancedReplyCodeSubject::Undefined => 0,
            EnhancedReplyCodeSubject::Addressing => 1,
            EnhancedReplyCodeSubject::Mailbox => 2,
            EnhancedReplyCodeSubject::MailSystem => 3,
            EnhancedReplyCodeSubject::Network => 4,
            EnhancedReplyCodeSubject::Protocol => 5,
            EnhancedReplyCodeSubject::Content => 6,
            EnhancedReplyCodeSubject::Policy => 7,
        }
    }

    fn from_digit(d: u8) -> Option<EnhancedReplyCodeSubject> {
        Some(match d {
            0 => EnhancedReplyCodeSubject::Undefined,
            1 => EnhancedReplyCodeSubject::Addressing,
            2 => EnhancedReplyCodeSubject::Mailbox,
            3 => EnhancedReplyCodeSubject::MailSystem,
            4 => EnhancedReplyCodeSubject::Network,
            5 => EnhancedReplyCodeSubject::Protocol,
            6 => EnhancedReplyCodeSubject::Content,
            7 => EnhancedReplyCodeSubject::Policy,
            _ => return None,
        })
    }
}

impl<S> EnhancedReplyCode<S> {
    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        self.subject
    }

    fn parse(buf: &[u8]) -> IResult<&[u8], EnhancedReplyCode<S>> {
        map_opt(
            tuple((
                map_res(take(1usize), |d: &[u8]| {
                    std::str::from_utf8(d).ok().and_then(|s| s.parse::<u8>().ok())
                }),
                preceded(tag("."), digits1_to_3),
                preceded(tag("."), digits1_to_3),
            )),
            |(class, subject, detail)| {
                Some(EnhancedReplyCode {
                    class: EnhancedReplyCodeClass::from_digit(class)?,
                    subject: EnhancedReplyCodeSubject::from_digit(subject.min(7) as u8)?,
                    detail,
                    text: None,
                })
            },
        )(buf)
    }

    fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        write!(w, "{}.{}.{}", self.class.digit(), self.subject.digit(), self.detail)
    }
}

fn digits1_to_3(buf: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        nom::bytes::streaming::take_while_m_n(1, 3, |b: u8| b.is_ascii_digit()),
        |d: &[u8]| std::str::from_utf8(d).unwrap().parse::<u16>(),
    )(buf)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsLastLine {
    Yes,
    No,
}

/// A single line of a (possibly multi-line) SMTP reply.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Clone, Debug)]
pub struct ReplyLine<S = String> {
    pub code: ReplyCode,
    pub is_last: IsLastLine,
    pub line: MaybeUtf8<S>,
}

impl<S> ReplyLine<S> {
    /// 512 is the maximum total line length allowed by RFC 5321, of which 3
    /// digits, one separator and the trailing CRLF are not part of the text.
    pub const MAX_LEN: usize = 506;
}

impl<'a> ReplyLine<&'a str> {
    fn parse(buf: &'a [u8]) -> IResult<&'a [u8], ReplyLine<&'a str>> {
        map(
            tuple((
                ReplyCode::parse,
                map(alt((tag("-"), tag(" "))), |sep: &[u8]| {
                    if sep == b" " {
                        IsLastLine::Yes
                    } else {
                        IsLastLine::No
                    }
                }),
                terminated(take_until("\r\n"), tag("\r\n")),
            )),
            |(code, is_last, line)| ReplyLine {
                code,
                is_last,
                line: MaybeUtf8::from(std::str::from_utf8(line).unwrap_or("")),
            },
        )(buf)
    }
}

impl<S> ReplyLine<S>
where
    S: AsRef<str>,
{
    pub fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        self.code.send_to(w)?;
        w.write_all(if self.is_last == IsLastLine::Yes {
            b" "
        } else {
            b"-"
        })?;
        w.write_all(self.line.as_str().as_bytes())?;
        w.write_all(b"\r\n")
    }
}

/// A full (possibly multi-line) SMTP reply, as sent by the server in
/// response to a command.
///
/// The enhanced status code, if any, is expected on the first line only, as
/// is customary, and is stripped off of `text`'s first element.
#[derive(Clone, Debug)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode<S>>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<'a> Reply<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Reply<&'a str>> {
        let (rem, first) = ReplyLine::<&'a str>::parse(buf)?;
        let code = first.code;

        let (ecode, first_text) = match first.line {
            MaybeUtf8::Ascii(s) | MaybeUtf8::Utf8(s) => split_ecode(s),
        };

        let mut text = vec![MaybeUtf8::from(first_text)];
        let mut rem = rem;
        let mut is_last = first.is_last;

        while is_last == IsLastLine::No {
            let (r, line) = ReplyLine::<&'a str>::parse(rem)?;
            rem = r;
            is_last = line.is_last;
            let line_text = match line.line {
                MaybeUtf8::Ascii(s) | MaybeUtf8::Utf8(s) => s,
            };
            text.push(MaybeUtf8::from(line_text));
        }

        Ok((
            rem,
            Reply {
                code,
                ecode,
                text,
            },
        ))
    }

    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode.map(|e| e.into()),
            text: self.text.into_iter().map(|t| t.to_owned()).collect(),
        }
    }
}

fn split_ecode(line: &str) -> (Option<EnhancedReplyCode<&str>>, &str) {
    match EnhancedReplyCode::<&str>::parse(line.as_bytes()) {
        Ok((rem, ecode)) if rem.starts_with(b" ") => (Some(ecode), &line[line.len() - rem.len() + 1..]),
        _ => (None, line),
    }
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    pub fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let n = self.text.len();
        if n == 0 {
            return ReplyLine {
                code: self.code,
                is_last: IsLastLine::Yes,
                line: MaybeUtf8::Ascii(""),
            }
            .send_to(w);
        }
        for (i, line) in self.text.iter().enumerate() {
            let is_last = if i + 1 == n {
                IsLastLine::Yes
            } else {
                IsLastLine::No
            };
            self.code.send_to(w)?;
            w.write_all(if is_last == IsLastLine::Yes { b" " } else { b"-" })?;
            if i == 0 {
                if let Some(ref ecode) = self.ecode {
                    ecode.send_to(w)?;
                    w.write_all(b" ")?;
                }
            }
            w.write_all(line.as_str().as_bytes())?;
            w.write_all(b"\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_kind() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(
            ReplyCode::START_MAIL_INPUT.kind(),
            ReplyCodeKind::PositiveIntermediate
        );
        assert_eq!(
            ReplyCode::LOCAL_ERROR.kind(),
            ReplyCodeKind::TransientNegative
        );
        assert_eq!(
            ReplyCode::COMMAND_UNRECOGNIZED.kind(),
            ReplyCodeKind::PermanentNegative
        );
    }

    #[test]
    fn single_line_reply() {
        let (rem, r) = Reply::parse(b"250 All is well\r\n").unwrap();
        assert_eq!(rem, b"");
        assert_eq!(r.code, ReplyCode::OKAY);
        assert!(r.ecode.is_none());
        assert_eq!(r.text, vec![MaybeUtf8::Ascii("All is well")]);
    }

    #[test]
    fn single_line_reply_with_ecode() {
        let (rem, r) = Reply::parse(b"250 2.1.5 Ok\r\n").unwrap();
        assert_eq!(rem, b"");
        assert_eq!(r.code, ReplyCode::OKAY);
        let ecode = r.ecode.unwrap();
        assert_eq!(ecode.class, EnhancedReplyCodeClass::Success);
        assert_eq!(ecode.subject, EnhancedReplyCodeSubject::Addressing);
        assert_eq!(ecode.detail, 5);
        assert_eq!(r.text, vec![MaybeUtf8::Ascii("Ok")]);
    }

    #[test]
    fn multi_line_reply() {
        let (rem, r) = Reply::parse(b"250-example.org\r\n250-PIPELINING\r\n250 STARTTLS\r\n").unwrap();
        assert_eq!(rem, b"");
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(
            r.text,
            vec![
                MaybeUtf8::Ascii("example.org"),
                MaybeUtf8::Ascii("PIPELINING"),
                MaybeUtf8::Ascii("STARTTLS"),
            ]
        );
    }

    #[test]
    fn incomplete_reply() {
        assert!(Reply::parse(b"250 Not fini").unwrap_err().is_incomplete());
    }

    #[test]
    fn reply_round_trip() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedReplyCode::SUCCESS_DEST_VALID.into()),
            text: vec![MaybeUtf8::Ascii("Ok".to_owned())],
        };
        let mut buf = Vec::new();
        r.send_to(&mut buf).unwrap();
        assert_eq!(buf, b"250 2.1.5 Ok\r\n");
    }
}
