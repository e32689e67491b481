//! Raw TCP transport with RESP framing
//!
//! A blocking connection with buffered reader/writer split, used both as
//! the shared submit lane of a node client and as the backing socket of a
//! dedicated wire. Socket failures surface as transport errors and
//! malformed frames as protocol errors; callers treat either as grounds
//! to discard the connection.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};

use crate::config::ConnectionOptions;
use crate::utils::{ClientError, ProtocolError, RespDecoder, RespEncoder, RespValue, Result};

pub struct RawConnection {
    writer: io::BufWriter<TcpStream>,
    reader: io::BufReader<TcpStream>,
    encoder: RespEncoder,
}

impl RawConnection {
    /// Dial `addr` ("host:port"), configure the socket, and run the AUTH
    /// preamble when credentials are configured.
    pub fn connect(addr: &str, options: &ConnectionOptions) -> Result<Self> {
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
            .map_err(ClientError::from)?;

        let stream = TcpStream::connect_timeout(&socket_addr, options.connect_timeout())
            .map_err(ClientError::from)?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(options.read_timeout())).ok();
        stream.set_write_timeout(Some(options.write_timeout())).ok();

        let writer = io::BufWriter::with_capacity(65536, stream.try_clone().map_err(ClientError::from)?);
        let reader = io::BufReader::with_capacity(65536, stream);

        let mut conn = Self {
            writer,
            reader,
            encoder: RespEncoder::with_capacity(256),
        };

        if let Some(auth) = &options.auth {
            conn.authenticate(&auth.password, auth.username.as_deref())?;
        }

        Ok(conn)
    }

    /// Submit one command and await its reply
    pub fn submit(&mut self, args: &[Vec<u8>]) -> Result<RespValue> {
        self.encoder.clear();
        self.encoder.encode_command(args);
        self.flush_encoded()?;
        RespDecoder::new(&mut self.reader).decode()
    }

    /// Submit a pipeline and await all replies in order
    pub fn submit_pipeline(&mut self, batches: &[&[Vec<u8>]]) -> Result<Vec<RespValue>> {
        self.encoder.clear();
        for args in batches {
            self.encoder.encode_command(args);
        }
        self.flush_encoded()?;
        RespDecoder::new(&mut self.reader).decode_pipeline(batches.len())
    }

    fn flush_encoded(&mut self) -> Result<()> {
        use io::Write;
        self.writer.write_all(self.encoder.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn authenticate(&mut self, password: &str, username: Option<&str>) -> Result<()> {
        let args: Vec<Vec<u8>> = match username {
            Some(user) => vec![
                b"AUTH".to_vec(),
                user.as_bytes().to_vec(),
                password.as_bytes().to_vec(),
            ],
            None => vec![b"AUTH".to_vec(), password.as_bytes().to_vec()],
        };

        match self.submit(&args)? {
            RespValue::SimpleString(s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(ClientError::Server(e)),
            other => Err(ProtocolError::UnexpectedResponse {
                expected: "OK".into(),
                actual: format!("{:?}", other),
            }
            .into()),
        }
    }
}
