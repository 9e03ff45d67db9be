//! Server-side RTMP command sequencing: drive a publishing client from
//! `connect` through `publish`, answering with the control messages and AMF
//! results encoders expect.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::core::error::RelayError;
use crate::rtmp::amf::{self, Amf0Value};
use crate::rtmp::chunk::{self, ChunkStream, Message, TX_CHUNK_SIZE};
use crate::rtmp::{
    is_command_type, TYPE_AMF0_COMMAND, TYPE_SET_CHUNK_SIZE, TYPE_SET_PEER_BW, TYPE_WINDOW_ACK,
};

/// Window acknowledgement size announced after `connect`.
pub const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Peer bandwidth announced after `connect`.
pub const PEER_BANDWIDTH: u32 = 2_500_000;

/// Peer bandwidth limit type: dynamic.
const PEER_BANDWIDTH_DYNAMIC: u8 = 2;

/// Drives the server side of a publisher's control channel.
pub struct ServerSession<R, W> {
    chunks: ChunkStream<R>,
    writer: W,
}

impl<R, W> ServerSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(chunks: ChunkStream<R>, writer: W) -> Self {
        Self { chunks, writer }
    }

    /// Recover the chunk reader and writer, e.g. to keep reading media
    /// messages after the publish sequence completed.
    pub fn into_parts(self) -> (ChunkStream<R>, W) {
        (self.chunks, self.writer)
    }

    /// Run the command sequence up to `publish` and return the stream name.
    ///
    /// Clients send releaseStream / FCPublish / createStream in varying
    /// orders before publish; unknown commands and non-command messages are
    /// ignored.
    pub async fn handshake(&mut self) -> Result<String, RelayError> {
        let connect = self.expect_command("connect").await?;
        let tid = connect
            .get(1)
            .and_then(Amf0Value::as_number)
            .unwrap_or(0.0);

        self.write_protocol_control(TYPE_WINDOW_ACK, WINDOW_ACK_SIZE, &[])
            .await?;
        self.write_protocol_control(TYPE_SET_PEER_BW, PEER_BANDWIDTH, &[PEER_BANDWIDTH_DYNAMIC])
            .await?;
        self.write_protocol_control(TYPE_SET_CHUNK_SIZE, TX_CHUNK_SIZE as u32, &[])
            .await?;

        let props = amf::object(&[
            ("fmsVer", Amf0Value::String("FMS/3,0,1,123".into())),
            ("capabilities", Amf0Value::Number(31.0)),
        ]);
        let info = amf::object(&[
            ("level", Amf0Value::String("status".into())),
            (
                "code",
                Amf0Value::String("NetConnection.Connect.Success".into()),
            ),
            (
                "description",
                Amf0Value::String("Connection succeeded.".into()),
            ),
            ("objectEncoding", Amf0Value::Number(0.0)),
        ]);
        self.write_command("_result", tid, &[props, info]).await?;

        loop {
            let msg = self.chunks.read_message().await?;
            if !is_command_type(msg.header.type_id) {
                continue;
            }

            let values = amf::decode_command(msg.header.type_id, &msg.payload)?;
            if values.is_empty() {
                continue;
            }
            let name = values[0].as_str().unwrap_or("");
            let tid = values.get(1).and_then(Amf0Value::as_number).unwrap_or(0.0);

            match name {
                "releaseStream" | "FCPublish" => {}
                "createStream" => {
                    self.write_command(
                        "_result",
                        tid,
                        &[Amf0Value::Null, Amf0Value::Number(1.0)],
                    )
                    .await?;
                }
                "publish" => {
                    let stream_name = values
                        .get(3)
                        .and_then(Amf0Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    let status = amf::object(&[
                        ("level", Amf0Value::String("status".into())),
                        (
                            "code",
                            Amf0Value::String("NetStream.Publish.Start".into()),
                        ),
                        (
                            "description",
                            Amf0Value::String("Start publishing".into()),
                        ),
                    ]);
                    self.write_command("onStatus", 0.0, &[Amf0Value::Null, status])
                        .await?;

                    return Ok(stream_name);
                }
                _ => {}
            }
        }
    }

    /// Read messages until a command with the given name arrives.
    async fn expect_command(&mut self, name: &str) -> Result<Vec<Amf0Value>, RelayError> {
        loop {
            let msg = self.chunks.read_message().await?;
            if !is_command_type(msg.header.type_id) {
                continue;
            }
            let values = amf::decode_command(msg.header.type_id, &msg.payload)?;
            if values.first().and_then(Amf0Value::as_str) == Some(name) {
                return Ok(values);
            }
        }
    }

    async fn write_command(
        &mut self,
        name: &str,
        tid: f64,
        args: &[Amf0Value],
    ) -> Result<(), RelayError> {
        let mut values = vec![
            Amf0Value::String(name.to_string()),
            Amf0Value::Number(tid),
        ];
        values.extend_from_slice(args);
        let payload = amf::encode_all(&values);
        chunk::write_message(&mut self.writer, TYPE_AMF0_COMMAND, &payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_protocol_control(
        &mut self,
        type_id: u8,
        value: u32,
        extra: &[u8],
    ) -> Result<(), RelayError> {
        let mut payload = value.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        chunk::write_message(&mut self.writer, type_id, &payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Message, RelayError> {
        self.chunks.read_message().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{ReadHalf, WriteHalf};

    type Pipe = tokio::io::DuplexStream;

    async fn write_client_command(
        w: &mut WriteHalf<Pipe>,
        values: &[Amf0Value],
    ) -> std::io::Result<()> {
        let payload = amf::encode_all(values);
        chunk::write_message(w, TYPE_AMF0_COMMAND, &payload).await
    }

    async fn read_until_command(
        cs: &mut ChunkStream<ReadHalf<Pipe>>,
    ) -> Vec<Amf0Value> {
        loop {
            let msg = cs.read_message().await.unwrap();
            if is_command_type(msg.header.type_id) {
                return amf::decode_command(msg.header.type_id, &msg.payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_publish_sequence() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);

        let session_task = tokio::spawn(async move {
            let mut session =
                ServerSession::new(ChunkStream::new(server_read), server_write);
            session.handshake().await
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut client_chunks = ChunkStream::new(client_read);

        // Raise the server's receive chunk size so larger commands fit.
        chunk::write_message(
            &mut client_write,
            TYPE_SET_CHUNK_SIZE,
            &(TX_CHUNK_SIZE as u32).to_be_bytes(),
        )
        .await
        .unwrap();

        write_client_command(
            &mut client_write,
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(1.0),
                amf::object(&[
                    ("app", Amf0Value::String("live".into())),
                    (
                        "tcUrl",
                        Amf0Value::String("rtmp://localhost/live".into()),
                    ),
                ]),
            ],
        )
        .await
        .unwrap();

        // Window ack, peer bandwidth, set chunk size, then the _result.
        let ack = client_chunks.read_message().await.unwrap();
        assert_eq!(ack.header.type_id, TYPE_WINDOW_ACK);
        assert_eq!(&ack.payload[..4], &WINDOW_ACK_SIZE.to_be_bytes());

        let bw = client_chunks.read_message().await.unwrap();
        assert_eq!(bw.header.type_id, TYPE_SET_PEER_BW);
        assert_eq!(bw.payload[4], PEER_BANDWIDTH_DYNAMIC);

        let set_size = client_chunks.read_message().await.unwrap();
        assert_eq!(set_size.header.type_id, TYPE_SET_CHUNK_SIZE);

        let result = read_until_command(&mut client_chunks).await;
        assert_eq!(result[0].as_str(), Some("_result"));
        assert_eq!(result[1].as_number(), Some(1.0));
        let info = result[3].as_object().unwrap();
        assert_eq!(
            info["code"].as_str(),
            Some("NetConnection.Connect.Success")
        );

        // releaseStream and FCPublish draw no response.
        write_client_command(
            &mut client_write,
            &[
                Amf0Value::String("releaseStream".into()),
                Amf0Value::Number(2.0),
                Amf0Value::Null,
                Amf0Value::String("cam1".into()),
            ],
        )
        .await
        .unwrap();
        write_client_command(
            &mut client_write,
            &[
                Amf0Value::String("FCPublish".into()),
                Amf0Value::Number(3.0),
                Amf0Value::Null,
                Amf0Value::String("cam1".into()),
            ],
        )
        .await
        .unwrap();

        write_client_command(
            &mut client_write,
            &[
                Amf0Value::String("createStream".into()),
                Amf0Value::Number(4.0),
                Amf0Value::Null,
            ],
        )
        .await
        .unwrap();

        let create_result = read_until_command(&mut client_chunks).await;
        assert_eq!(create_result[0].as_str(), Some("_result"));
        assert_eq!(create_result[1].as_number(), Some(4.0));
        assert_eq!(create_result[3].as_number(), Some(1.0)); // stream id

        write_client_command(
            &mut client_write,
            &[
                Amf0Value::String("publish".into()),
                Amf0Value::Number(5.0),
                Amf0Value::Null,
                Amf0Value::String("cam1".into()),
                Amf0Value::String("live".into()),
            ],
        )
        .await
        .unwrap();

        let status = read_until_command(&mut client_chunks).await;
        assert_eq!(status[0].as_str(), Some("onStatus"));
        let status_info = status[3].as_object().unwrap();
        assert_eq!(
            status_info["code"].as_str(),
            Some("NetStream.Publish.Start")
        );

        let stream_name = session_task.await.unwrap().unwrap();
        assert_eq!(stream_name, "cam1");
    }
}
