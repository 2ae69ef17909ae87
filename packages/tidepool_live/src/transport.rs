use std::future::Future;
use std::time::Duration;

use futures::{StreamExt, stream::BoxStream};

use crate::error::Error;
use crate::sse::{Frame, FrameParser};

/// A live stream of decoded frames. Ends (`None`) when the remote side
/// closes the stream cleanly; a mid-stream fault surfaces as one `Err`
/// item and then the stream ends.
pub type FrameStream = BoxStream<'static, Result<Frame, Error>>;

/// Unidirectional push channel: each connect yields a fresh frame stream.
///
/// This seam keeps the reconnect state machine independent of any concrete
/// transport; [`HttpEventSource`] is the production implementation and
/// tests script their own.
pub trait EventSource: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<FrameStream, Error>> + Send;
}

/// Streams `text/event-stream` frames from a Tidepool server over HTTP.
pub struct HttpEventSource {
    client: reqwest::Client,
    url: String,
    session_token: Option<String>,
}

impl HttpEventSource {
    /// `base_url` is the server root, e.g. `http://localhost:3001`. The
    /// session token, when present, rides in the same cookie a browser
    /// would send.
    pub fn new(base_url: &str, session_token: Option<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/api/todos/events", base_url.trim_end_matches('/')),
            session_token,
        })
    }
}

impl EventSource for HttpEventSource {
    fn connect(&self) -> impl Future<Output = Result<FrameStream, Error>> + Send {
        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.session_token {
            request = request.header(reqwest::header::COOKIE, format!("tide_session={token}"));
        }

        async move {
            let response = request
                .send()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                // the server turned the stream away before it opened
                return Err(Error::RemoteClosed(format!("HTTP {status}")));
            }

            let stream = futures::stream::unfold(
                (response.bytes_stream(), FrameParser::default(), false),
                |(mut body, mut parser, errored)| async move {
                    if errored {
                        return None;
                    }
                    loop {
                        if let Some(frame) = parser.next_frame() {
                            return Some((Ok(frame), (body, parser, false)));
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => parser.push(&chunk),
                            Some(Err(e)) => {
                                return Some((
                                    Err(Error::Transport(e.to_string())),
                                    (body, parser, true),
                                ));
                            }
                            // clean end of stream; a partial trailing frame
                            // is discarded with it
                            None => return None,
                        }
                    }
                },
            );

            Ok(stream.boxed())
        }
    }
}
