use std::{borrow::Cow, io};

use crate::{
    AggregationError, Deserialize, ParameterCodec, ParameterSet, Serialize,
    codec::Reader,
    specs::{
        AggregatedResult, Contribution, ContributionHeader, PayloadKind, Phase, Reduction,
        RoundKey,
    },
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const CONTRIBUTION_H: Header = 2;
const AGGREGATED_H: Header = 3;
const SNAPSHOT_H: Header = 4;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Identifies the worker behind a new connection.
    Connect { worker_id: u32 },
    /// Asks for the canonical model at `min_version` or newer.
    Fetch { min_version: u64 },
    Ack,
    Disconnect,
}

/// The application layer message for the entire system.
///
/// Data carrying variants borrow when sending and own when received.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    /// A worker's payload toward a round.
    Contribution(Cow<'a, Contribution>),
    /// The reduced result of a round.
    Aggregated(Cow<'a, AggregatedResult>),
    /// A versioned canonical model, published by the coordinator role or fetched by a worker.
    Snapshot {
        version: u64,
        params: Cow<'a, ParameterSet>,
    },
    Err(AggregationError),
}

impl Msg<'_> {
    /// A short name of the message kind, used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Connect { .. }) => "connect",
            Msg::Control(Command::Fetch { .. }) => "fetch",
            Msg::Control(Command::Ack) => "ack",
            Msg::Control(Command::Disconnect) => "disconnect",
            Msg::Contribution(_) => "contribution",
            Msg::Aggregated(_) => "aggregated",
            Msg::Snapshot { .. } => "snapshot",
            Msg::Err(_) => "error",
        }
    }
}

fn put_round(buf: &mut Vec<u8>, round: RoundKey) {
    buf.extend_from_slice(&round.round.to_le_bytes());
    buf.push(round.phase.tag());
}

fn read_round(reader: &mut Reader<'_>) -> Result<RoundKey, AggregationError> {
    let round = reader.u64("round")?;
    let phase = Phase::from_tag(reader.u8("phase")?)?;
    Ok(RoundKey::new(round, phase))
}

impl Serialize for Msg<'_> {
    fn serialize(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Msg::Err(err) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                serde_json::to_writer(&mut *buf, err)?;
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
            }
            Msg::Contribution(contribution) => {
                let ContributionHeader {
                    round,
                    worker_id,
                    sample_count,
                    kind,
                    reduction,
                } = contribution.header;

                buf.extend_from_slice(&CONTRIBUTION_H.to_be_bytes());
                put_round(buf, round);
                buf.extend_from_slice(&worker_id.to_le_bytes());
                buf.extend_from_slice(&sample_count.to_le_bytes());
                buf.push(kind.tag());
                buf.push(reduction.tag());
                ParameterCodec::encode_into(&contribution.params, buf);
            }
            Msg::Aggregated(result) => {
                buf.extend_from_slice(&AGGREGATED_H.to_be_bytes());
                put_round(buf, result.round);
                buf.extend_from_slice(&result.contributors.to_le_bytes());
                buf.extend_from_slice(&result.total_samples.to_le_bytes());
                ParameterCodec::encode_into(&result.params, buf);
            }
            Msg::Snapshot { version, params } => {
                buf.extend_from_slice(&SNAPSHOT_H.to_be_bytes());
                buf.extend_from_slice(&version.to_le_bytes());
                ParameterCodec::encode_into(params, buf);
            }
        }

        Ok(())
    }
}

impl Deserialize for Msg<'_> {
    fn deserialize(buf: &[u8]) -> Result<Self, AggregationError> {
        if buf.len() < HEADER_SIZE {
            return Err(AggregationError::corrupt(format!(
                "the given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            )));
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        let json_err =
            |e: serde_json::Error| AggregationError::corrupt(format!("invalid json body: {e}"));

        let mut reader = Reader::new(rest);
        let msg = match Header::from_be_bytes(kind) {
            ERR_H => return serde_json::from_slice(rest).map(Msg::Err).map_err(json_err),
            CONTROL_H => return serde_json::from_slice(rest).map(Msg::Control).map_err(json_err),
            CONTRIBUTION_H => {
                let header = ContributionHeader {
                    round: read_round(&mut reader)?,
                    worker_id: reader.u32("worker id")?,
                    sample_count: reader.u64("sample count")?,
                    kind: PayloadKind::from_tag(reader.u8("payload kind")?)?,
                    reduction: Reduction::from_tag(reader.u8("reduction")?)?,
                };
                let params = ParameterCodec::decode_from(&mut reader)?;

                Msg::Contribution(Cow::Owned(Contribution { header, params }))
            }
            AGGREGATED_H => {
                let round = read_round(&mut reader)?;
                let contributors = reader.u32("contributors")?;
                let total_samples = reader.u64("total samples")?;
                let params = ParameterCodec::decode_from(&mut reader)?;

                Msg::Aggregated(Cow::Owned(AggregatedResult {
                    round,
                    contributors,
                    total_samples,
                    params,
                }))
            }
            SNAPSHOT_H => {
                let version = reader.u64("version")?;
                let params = ParameterCodec::decode_from(&mut reader)?;

                Msg::Snapshot {
                    version,
                    params: Cow::Owned(params),
                }
            }
            other => {
                return Err(AggregationError::corrupt(format!(
                    "received an invalid kind header {other}"
                )));
            }
        };

        reader.finish()?;
        Ok(msg)
    }
}
