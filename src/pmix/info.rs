use bytes::{Buf, BufMut};

use super::value::Value;
use crate::coordinator::protocol::{ProtocolError, ensure, get_string, put_string};

/// Well-known info keys provided by the server for every namespace.
pub const JOB_SIZE: &str = "pmix.job.size";
pub const LOCAL_SIZE: &str = "pmix.local.size";
pub const NSPACE: &str = "pmix.nspace";
pub const RANK: &str = "pmix.rank";

#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    pub key: String,
    pub value: Value,
}

impl Info {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.key);
        self.value.encode(buf);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let key = get_string(buf)?;
        let value = Value::decode(buf)?;
        Ok(Self { key, value })
    }
}

pub fn find<'a>(infos: &'a [Info], key: &str) -> Option<&'a Value> {
    infos.iter().find(|i| i.key == key).map(|i| &i.value)
}

/// An application to launch through `spawn`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct App {
    pub cmd: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub maxprocs: u32,
}

impl App {
    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.cmd);
        put_strings(buf, &self.argv);
        put_strings(buf, &self.env);
        buf.put_u32(self.maxprocs);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let cmd = get_string(buf)?;
        let argv = get_strings(buf)?;
        let env = get_strings(buf)?;
        ensure(buf, 4)?;
        let maxprocs = buf.get_u32();
        Ok(Self {
            cmd,
            argv,
            env,
            maxprocs,
        })
    }
}

pub(crate) fn put_strings(buf: &mut impl BufMut, strings: &[String]) {
    buf.put_u32(strings.len() as u32);
    for s in strings {
        put_string(buf, s);
    }
}

pub(crate) fn get_strings(buf: &mut impl Buf) -> Result<Vec<String>, ProtocolError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    (0..count).map(|_| get_string(buf)).collect()
}
