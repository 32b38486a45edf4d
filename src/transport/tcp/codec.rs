//! Length prefixed framing for the messages peers exchange over tcp.
//!
//! Every frame is `[u64 BE length][u32 BE kind][body]`. Control messages are json,
//! contributions carry a small json header followed by the raw `f32` values.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    averaging::Contribution,
    transport::{PeerId, ProgressReport, StateSnapshot},
};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const MAX_FRAME_LEN: usize = 1 << 30;

const KIND_ERR: Header = 0;
const KIND_CONTROL: Header = 1;
const KIND_CONTRIBUTION: Header = 2;

/// Small messages that coordinate peers outside of rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// First message on every connection, in both directions.
    Hello {
        peer: PeerId,
        run_id: String,
        addrs: Vec<String>,
    },
    Progress(ProgressReport),
    StateRequest,
    State(Option<StateSnapshot>),
    Disconnect,
}

/// The application layer message between two peers.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Control(Control),
    Contribution(Contribution),
    Err(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct ContributionMeta {
    peer: PeerId,
    run_id: String,
    epoch: u64,
    samples: u64,
    len: usize,
    has_parameters: bool,
}

fn invalid_data<T>(msg: impl Into<String>) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
}

impl Msg {
    fn serialize(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&KIND_ERR.to_be_bytes());
                buf.extend_from_slice(e.as_bytes());
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&KIND_CONTROL.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
            }
            Msg::Contribution(c) => {
                buf.extend_from_slice(&KIND_CONTRIBUTION.to_be_bytes());

                let meta = ContributionMeta {
                    peer: c.peer.clone(),
                    run_id: c.run_id.clone(),
                    epoch: c.epoch,
                    samples: c.samples,
                    len: c.gradient.len(),
                    has_parameters: c.parameters.is_some(),
                };
                let meta = serde_json::to_vec(&meta)?;

                buf.extend_from_slice(&(meta.len() as Header).to_be_bytes());
                buf.extend_from_slice(&meta);
                buf.extend_from_slice(bytemuck::cast_slice(&c.gradient));
                if let Some(params) = &c.parameters {
                    buf.extend_from_slice(bytemuck::cast_slice(params));
                }
            }
        }

        Ok(())
    }

    fn deserialize(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return invalid_data(format!(
                "frame of {} bytes is too small, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        }

        let (kind, rest) = buf.split_at(HEADER_SIZE);
        let kind = Header::from_be_bytes([kind[0], kind[1], kind[2], kind[3]]);

        match kind {
            KIND_ERR => {
                let msg = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Ok(Self::Err(msg.to_string()))
            }
            KIND_CONTROL => Ok(Self::Control(serde_json::from_slice(rest)?)),
            KIND_CONTRIBUTION => Self::deserialize_contribution(rest),
            kind => invalid_data(format!("received an invalid kind {kind}")),
        }
    }

    fn deserialize_contribution(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return invalid_data("truncated contribution header");
        }

        let (meta_len, rest) = buf.split_at(HEADER_SIZE);
        let meta_len = Header::from_be_bytes([meta_len[0], meta_len[1], meta_len[2], meta_len[3]]) as usize;
        if rest.len() < meta_len {
            return invalid_data("truncated contribution header");
        }

        let (meta, nums) = rest.split_at(meta_len);
        let meta: ContributionMeta = serde_json::from_slice(meta)?;

        let width = size_of::<f32>();
        let vectors = if meta.has_parameters { 2 } else { 1 };
        let Some(grad_len) = meta.len.checked_mul(width) else {
            return invalid_data(format!("contribution of {} values is too large", meta.len));
        };

        if grad_len.checked_mul(vectors) != Some(nums.len()) {
            return invalid_data(format!(
                "contribution of {} values carries {} bytes",
                meta.len,
                nums.len()
            ));
        }

        let (grad, params) = nums.split_at(grad_len);
        let gradient = read_floats(grad);
        let parameters = meta.has_parameters.then(|| read_floats(params));

        Ok(Self::Contribution(Contribution {
            peer: meta.peer,
            run_id: meta.run_id,
            epoch: meta.epoch,
            samples: meta.samples,
            gradient,
            parameters,
        }))
    }
}

fn read_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(size_of::<f32>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// The sending end of a connection.
pub struct MsgSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> MsgSender<W> {
    /// Sends `msg` as a single frame.
    pub async fn send(&mut self, msg: &Msg) -> io::Result<()> {
        let Self { tx, buf } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);
        msg.serialize(buf)?;

        let len = buf.len() - LEN_TYPE_SIZE;
        buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());

        tx.write_all(buf).await?;
        tx.flush().await
    }
}

/// The receiving end of a connection.
pub struct MsgReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MsgReceiver<R> {
    /// Waits for the next frame.
    ///
    /// # Returns
    /// The decoded message, `UnexpectedEof` once the peer closed the connection or
    /// `InvalidData` for a malformed or oversized frame.
    pub async fn recv(&mut self) -> io::Result<Msg> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;

        let len = LenType::from_be_bytes(size_buf) as usize;
        if len > MAX_FRAME_LEN {
            return invalid_data(format!("frame of {len} bytes exceeds the limit"));
        }

        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        Msg::deserialize(&self.buf)
    }
}

/// Creates both ends of a connection out of its read and write halves.
pub fn channel<R, W>(rx: R, tx: W) -> (MsgReceiver<R>, MsgSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (
        MsgReceiver {
            rx,
            buf: Vec::new(),
        },
        MsgSender {
            tx,
            buf: Vec::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(parameters: Option<Vec<f32>>) -> Contribution {
        Contribution {
            peer: PeerId::new("a"),
            run_id: "run".into(),
            epoch: 9,
            samples: 64,
            gradient: vec![0.5, -1.25, 3.0],
            parameters,
        }
    }

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let (one, two) = tokio::io::duplex(64);
        let (_, tx) = tokio::io::split(one);
        let (rx, _) = tokio::io::split(two);
        let (_, mut tx) = channel(tokio::io::empty(), tx);
        let (mut rx, _) = channel(rx, tokio::io::sink());

        let msgs = vec![
            Msg::Control(Control::Hello {
                peer: PeerId::new("a"),
                run_id: "run".into(),
                addrs: vec!["127.0.0.1:4000".into()],
            }),
            Msg::Contribution(contribution(None)),
            Msg::Contribution(contribution(Some(vec![1.0, 2.0, 3.0]))),
            Msg::Control(Control::State(None)),
            Msg::Err("bye".into()),
        ];

        let expected = msgs.clone();
        let writer = tokio::spawn(async move {
            for msg in &msgs {
                tx.send(msg).await.unwrap();
            }
        });

        for msg in expected {
            assert_eq!(rx.recv().await.unwrap(), msg);
        }
        writer.await.unwrap();
    }

    #[test]
    fn rejects_truncated_contribution() {
        let mut buf = Vec::new();
        Msg::Contribution(contribution(None)).serialize(&mut buf).unwrap();
        buf.pop();

        let err = Msg::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_value_count() {
        for has_parameters in [false, true] {
            let meta = ContributionMeta {
                peer: PeerId::new("a"),
                run_id: "run".into(),
                epoch: 0,
                samples: 1,
                len: usize::MAX / 2,
                has_parameters,
            };
            let meta = serde_json::to_vec(&meta).unwrap();

            let mut buf = KIND_CONTRIBUTION.to_be_bytes().to_vec();
            buf.extend_from_slice(&(meta.len() as Header).to_be_bytes());
            buf.extend_from_slice(&meta);
            buf.extend_from_slice(&[0; 8]);

            let err = Msg::deserialize(&buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let buf = 7u32.to_be_bytes();
        assert!(Msg::deserialize(&buf).is_err());
    }

    #[tokio::test]
    async fn closed_connection_is_eof() {
        let (one, two) = tokio::io::duplex(64);
        drop(one);
        let (mut rx, _) = channel(two, tokio::io::sink());
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
