use aegis_common::{ConnectEvent, Event, EventHeader, EventType, ExecEvent, FileOpenEvent};
use anyhow::bail;

/// One decoded ring buffer record.
#[derive(Clone, Copy, Debug)]
pub enum Record {
    Exec(ExecEvent),
    FileOpen(FileOpenEvent),
    Connect(ConnectEvent),
}

impl Record {
    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < EventHeader::SIZE {
            bail!("record of {} bytes is shorter than the event header", buf.len());
        }
        let header = unsafe { (buf.as_ptr() as *const EventHeader).read_unaligned() };
        let Some(kind) = header.event_type() else {
            bail!("unknown event type tag {}", header.kind);
        };
        Ok(match kind {
            EventType::Exec => Record::Exec(read(buf)?),
            EventType::FileOpen => Record::FileOpen(read(buf)?),
            EventType::Connect => Record::Connect(read(buf)?),
        })
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            Record::Exec(e) => &e.header,
            Record::FileOpen(e) => &e.header,
            Record::Connect(e) => &e.header,
        }
    }
}

fn read<T: Event>(buf: &[u8]) -> anyhow::Result<T> {
    if buf.len() < T::SIZE {
        bail!("{} record needs {} bytes, got {}", T::TYPE, T::SIZE, buf.len());
    }
    Ok(unsafe { (buf.as_ptr() as *const T).read_unaligned() })
}
