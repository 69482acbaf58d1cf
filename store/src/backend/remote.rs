use std::{
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::{header::CONTENT_TYPE, Method};
use reqwest_middleware::ClientWithMiddleware;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tokio_retry::{strategy::FixedInterval, Retry};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::{CopyToBytes, SinkWriter, StreamReader},
    sync::{CancellationToken, PollSender},
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DataSourceReader, DataSourceWriter, StoreBackend};
use crate::{
    events::{NodeEvent, DEFAULT_QUEUE_CAPACITY},
    node::{
        validate_name, AttributeType, AttributeValue, BackwardDependency, NodeDependency, NodeId,
        NodeInfo, RootNode,
    },
    protocol::{CreateNodeRequest, DescriptionRequest, RenameRequest, SetParentRequest},
    Error,
};

/// Tunables of a [RemoteStore], usually passed as query parameters of the
/// store address, like `remote+http://[::1]:8000/shared?timeout=10`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteStoreConfig {
    /// Timeout of a single request, in seconds. Streaming requests only
    /// bound the connect phase with it.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Delay between attempts to re-establish a broken event stream, in
    /// milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    500
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

/// Connects to a drive hosted by a remote server.
///
/// Every contract call becomes one HTTP request. Mutations are never retried:
/// a request that timed out fails with [Error::NetworkError], and its
/// outcome is unknown.
///
/// Alongside, a long-lived event stream of the drive is kept open, and handed
/// out once through [StoreBackend::take_event_feed]. If the stream breaks,
/// it's re-established after a fixed delay. Events published in between are
/// lost, observers need to re-list what they are interested in.
pub struct RemoteStore {
    base_url: Url,
    drive: String,

    /// Client for unary requests, with a timeout for the whole request.
    http_client: ClientWithMiddleware,
    /// Client for streaming requests, which may take arbitrarily long.
    stream_client: ClientWithMiddleware,

    event_feed: Mutex<Option<mpsc::Receiver<NodeEvent>>>,

    /// Cancelled on close, stops the event stream.
    closed: CancellationToken,
}

impl RemoteStore {
    /// Connects to the drive `drive` at the server listening at `base_url`.
    /// Returns once the event stream is established, so every mutation
    /// committed on the server afterwards is observed.
    pub async fn connect(
        base_url: Url,
        drive: &str,
        config: RemoteStoreConfig,
    ) -> Result<Self, Error> {
        validate_name(drive)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::ConfigurationError(format!(
                "invalid remote base url: {}",
                base_url
            )));
        }

        let timeout = Duration::from_secs(config.timeout);
        let http_client = make_client(reqwest::Client::builder().timeout(timeout))?;
        let stream_client = make_client(reqwest::Client::builder().connect_timeout(timeout))?;

        let store = Self {
            base_url,
            drive: drive.to_string(),
            http_client,
            stream_client,
            event_feed: Mutex::new(None),
            closed: CancellationToken::new(),
        };

        let events_url = store.drive_url(&["events"])?;
        let resp = open_event_stream(&store.stream_client, &events_url).await?;

        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        *store.event_feed.lock() = Some(rx);
        tokio::spawn(pump_events(
            store.stream_client.clone(),
            events_url,
            resp,
            tx,
            Duration::from_millis(config.reconnect_delay),
            store.closed.clone(),
        ));

        info!(base_url=%store.base_url, drive=%store.drive, "connected to remote drive");
        Ok(store)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::closed());
        }
        Ok(())
    }

    fn drive_url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::ConfigurationError("invalid remote base url".to_string()))?
            .pop_if_empty()
            .push("drives")
            .push(&self.drive)
            .extend(segments);
        Ok(url)
    }

    /// Builds the url of a node resource. Names taken from callers go
    /// through [validate_name] first, a `..` pushed as a segment would
    /// address another resource.
    fn node_url(&self, id: &NodeId, segments: &[&str]) -> Result<Url, Error> {
        let id = id.to_string();
        let mut all = vec!["nodes", id.as_str()];
        all.extend_from_slice(segments);
        self.drive_url(&all)
    }

    async fn create_child(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
        consistent: bool,
    ) -> Result<NodeInfo, Error> {
        validate_name(name)?;
        let body = json_body(&CreateNodeRequest {
            name: name.to_string(),
            pseudo_class: pseudo_class.to_string(),
            description: description.to_string(),
            consistent,
        })?;
        self.call(Method::POST, self.node_url(parent, &["children"])?, body)
            .await
    }

    /// Sends a unary request, and decodes the JSON response.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<T, Error> {
        self.ensure_open()?;

        debug!(method=%method, url=%url, "sending request");
        let mut req = self.http_client.request(method, url);
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(body);
        }

        let resp = check_response(req.send().await?).await?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            warn!(err=%e, "unable to decode response");
            Error::NetworkError(format!("unable to decode response: {}", e))
        })
    }
}

fn make_client(builder: reqwest::ClientBuilder) -> Result<ClientWithMiddleware, Error> {
    let client = builder
        .build()
        .map_err(|e| Error::ConfigurationError(format!("unable to build http client: {}", e)))?;

    Ok(reqwest_middleware::ClientBuilder::new(client)
        .with(afs_tracing::propagate::reqwest::tracing_middleware())
        .build())
}

fn json_body<T: Serialize>(value: &T) -> Result<Option<Vec<u8>>, Error> {
    serde_json::to_vec(value)
        .map(Some)
        .map_err(|e| Error::InvalidRequest(format!("unable to encode request: {}", e)))
}

/// Passes successful responses through. Failed ones carry an encoded
/// [Error], which is returned as is.
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.bytes().await?;
    match serde_json::from_slice::<Error>(&body) {
        Ok(e) => Err(e),
        Err(_) => Err(Error::NetworkError(format!(
            "unexpected response status {}",
            status
        ))),
    }
}

async fn open_event_stream(
    client: &ClientWithMiddleware,
    url: &Url,
) -> Result<reqwest::Response, Error> {
    check_response(client.get(url.clone()).send().await?).await
}

/// Reads newline-delimited events from the stream and feeds them into `tx`.
/// Re-connects when the stream breaks, until `closed` is cancelled or the
/// receiving side went away.
async fn pump_events(
    client: ClientWithMiddleware,
    url: Url,
    resp: reqwest::Response,
    tx: mpsc::Sender<NodeEvent>,
    reconnect_delay: Duration,
    closed: CancellationToken,
) {
    let mut resp = Some(resp);
    loop {
        let current = match resp.take() {
            Some(resp) => resp,
            None => {
                let reconnect = Retry::spawn(FixedInterval::new(reconnect_delay), || {
                    let (client, url) = (&client, &url);
                    async move {
                        open_event_stream(client, url).await.map_err(|e| {
                            debug!(err=%e, "unable to re-establish event stream");
                            e
                        })
                    }
                });

                tokio::select! {
                    _ = closed.cancelled() => return,
                    res = reconnect => match res {
                        Ok(resp) => {
                            info!(url=%url, "re-established event stream, events in between are lost");
                            resp
                        }
                        Err(e) => {
                            warn!(err=%e, "giving up on event stream");
                            return;
                        }
                    }
                }
            }
        };

        let reader = StreamReader::new(Box::pin(
            current
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
        ));
        let mut lines = FramedRead::new(reader, LinesCodec::new());

        loop {
            let line = tokio::select! {
                _ = closed.cancelled() => return,
                line = lines.next() => line,
            };

            match line {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => match serde_json::from_str::<NodeEvent>(&line) {
                    Ok(event) => {
                        tokio::select! {
                            _ = closed.cancelled() => return,
                            res = tx.send(event) => {
                                if res.is_err() {
                                    debug!("event feed receiver went away");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(err=%e, "unable to decode event, skipping"),
                },
                Some(Err(e)) => {
                    warn!(err=%e, "event stream broken");
                    break;
                }
                None => {
                    warn!("event stream ended");
                    break;
                }
            }
        }
    }
}

/// Returns the names of the drives hosted by the server at `base_url`.
pub async fn list_remote_drives(base_url: &Url) -> Result<Vec<String>, Error> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| Error::ConfigurationError("invalid remote base url".to_string()))?
        .pop_if_empty()
        .push("drives");

    let resp = check_response(reqwest::get(url).await?).await?;
    let body = resp.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::NetworkError(format!("unable to decode response: {}", e)))
}

#[async_trait]
impl StoreBackend for RemoteStore {
    #[instrument(skip(self))]
    async fn get_root_node(&self, drive_name: &str) -> Result<RootNode, Error> {
        if drive_name != self.drive {
            warn!(drive=%self.drive, "root requested under another drive name");
        }
        self.call(Method::GET, self.drive_url(&["root"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_node_info(&self, id: &NodeId) -> Result<NodeInfo, Error> {
        self.call(Method::GET, self.node_url(id, &[])?, None).await
    }

    #[instrument(skip(self, description), fields(node.parent_id = %parent))]
    async fn create_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.create_child(parent, name, pseudo_class, description, true)
            .await
    }

    #[instrument(skip(self, description), fields(node.parent_id = %parent))]
    async fn create_inconsistent_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.create_child(parent, name, pseudo_class, description, false)
            .await
    }

    #[instrument(skip(self), fields(node.id = %parent))]
    async fn get_child_nodes(&self, parent: &NodeId) -> Result<Vec<NodeInfo>, Error> {
        self.call(Method::GET, self.node_url(parent, &["children"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %parent))]
    async fn get_child_node(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<NodeInfo>, Error> {
        validate_name(name)?;
        self.call(Method::GET, self.node_url(parent, &["children", name])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_parent_node(&self, id: &NodeId) -> Result<Option<NodeInfo>, Error> {
        self.call(Method::GET, self.node_url(id, &["parent"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id, node.new_parent_id = %new_parent))]
    async fn set_parent_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<NodeId, Error> {
        let body = json_body(&SetParentRequest {
            parent_id: *new_parent,
        })?;
        self.call(Method::PUT, self.node_url(id, &["parent"])?, body)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn rename_node(&self, id: &NodeId, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let body = json_body(&RenameRequest {
            name: name.to_string(),
        })?;
        self.call(Method::PUT, self.node_url(id, &["name"])?, body)
            .await
    }

    #[instrument(skip(self, description), fields(node.id = %id))]
    async fn set_description(&self, id: &NodeId, description: &str) -> Result<(), Error> {
        let body = json_body(&DescriptionRequest {
            description: description.to_string(),
        })?;
        self.call(Method::PUT, self.node_url(id, &["description"])?, body)
            .await
    }

    #[instrument(skip(self, value), fields(node.id = %id))]
    async fn set_attribute(
        &self,
        id: &NodeId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), Error> {
        validate_name(name)?;
        value.validate()?;
        let body = json_body(&value)?;
        self.call(Method::PUT, self.node_url(id, &["attrs", name])?, body)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_attribute(
        &self,
        id: &NodeId,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error> {
        validate_name(name)?;
        let mut url = self.node_url(id, &["attrs", name])?;
        url.query_pairs_mut()
            .append_pair("type", &attr_type.to_string());
        self.call(Method::GET, url, None).await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn remove_attribute(&self, id: &NodeId, name: &str) -> Result<bool, Error> {
        validate_name(name)?;
        self.call(Method::DELETE, self.node_url(id, &["attrs", name])?, None)
            .await
    }

    /// Returns a writer streaming into a PUT request. Errors of the server
    /// side surface on [DataSourceWriter::close] at the latest.
    #[instrument(skip(self), fields(node.id = %id))]
    async fn open_data_source_write(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceWriter>, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;
        // fail early if the node doesn't exist.
        self.get_node_info(id).await?;

        let url = self.node_url(id, &["attrs", attr_name, "files", file_name])?;

        // set up an mpsc channel passing around Bytes.
        let (tx, rx) = mpsc::channel::<Bytes>(10);
        let body_stream = ReceiverStream::new(rx).map(Ok::<_, io::Error>);

        // spawn the PUT request, which will read from body_stream.
        let task = tokio::spawn({
            let client = self.stream_client.clone();
            async move {
                let resp = client
                    .put(url)
                    .body(reqwest::Body::wrap_stream(body_stream))
                    .send()
                    .await?;
                check_response(resp).await?;
                Ok::<_, Error>(())
            }
        });

        // The tx part of the channel is converted to a sink of byte chunks.
        let sink = PollSender::new(tx).sink_map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e));

        // … which is turned into an [tokio::io::AsyncWrite].
        let writer = SinkWriter::new(CopyToBytes::new(sink));

        Ok(Box::new(RemoteDataSourceWriter {
            task_and_writer: Some((task, writer)),
            committed: false,
        }))
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn open_data_source_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;
        self.ensure_open()?;

        let url = self.node_url(id, &["attrs", attr_name, "files", file_name])?;
        let resp = check_response(self.stream_client.get(url).send().await?).await?;

        // get an AsyncRead of the response body.
        let reader = StreamReader::new(Box::pin(resp.bytes_stream().map_err(|e| {
            let e = e.without_url();
            warn!(err=%e, "failed to get response body");
            io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
        })));
        Ok(Box::new(reader))
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn data_source_file_exists(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;
        self.call(
            Method::GET,
            self.node_url(id, &["attrs", attr_name, "files", file_name, "exists"])?,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn list_data_source_files(
        &self,
        id: &NodeId,
        attr_name: &str,
    ) -> Result<Vec<String>, Error> {
        validate_name(attr_name)?;
        self.call(
            Method::GET,
            self.node_url(id, &["attrs", attr_name, "files"])?,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_data_source_names(&self, id: &NodeId) -> Result<Vec<String>, Error> {
        self.call(Method::GET, self.node_url(id, &["datasources"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn remove_data_source_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;
        self.call(
            Method::DELETE,
            self.node_url(id, &["attrs", attr_name, "files", file_name])?,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(node.id = %id, node.target_id = %target))]
    async fn add_dependency(&self, id: &NodeId, name: &str, target: &NodeId) -> Result<(), Error> {
        validate_name(name)?;
        let target = target.to_string();
        self.call(
            Method::POST,
            self.node_url(id, &["deps", name, &target])?,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_dependencies(&self, id: &NodeId, name: &str) -> Result<Vec<NodeId>, Error> {
        validate_name(name)?;
        self.call(Method::GET, self.node_url(id, &["deps", name])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_all_dependencies(&self, id: &NodeId) -> Result<Vec<NodeDependency>, Error> {
        self.call(Method::GET, self.node_url(id, &["deps"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_backward_dependencies(
        &self,
        id: &NodeId,
    ) -> Result<Vec<BackwardDependency>, Error> {
        self.call(Method::GET, self.node_url(id, &["backward-deps"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id, node.target_id = %target))]
    async fn remove_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<bool, Error> {
        validate_name(name)?;
        let target = target.to_string();
        self.call(
            Method::DELETE,
            self.node_url(id, &["deps", name, &target])?,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn set_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.call(Method::PUT, self.node_url(id, &["consistent"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn is_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.call(Method::GET, self.node_url(id, &["consistent"])?, None)
            .await
    }

    #[instrument(skip(self))]
    async fn get_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.call(Method::GET, self.drive_url(&["inconsistent"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn is_writable(&self, id: &NodeId) -> Result<bool, Error> {
        self.call(Method::GET, self.node_url(id, &["writable"])?, None)
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn delete_node(&self, id: &NodeId) -> Result<NodeId, Error> {
        self.call(Method::DELETE, self.node_url(id, &[])?, None)
            .await
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> Result<(), Error> {
        self.call(Method::POST, self.drive_url(&["flush"])?, None)
            .await
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<(), Error> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            debug!(drive=%self.drive, "closed remote store");
        }
        Ok(())
    }

    fn take_event_feed(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.event_feed.lock().take()
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

pub struct RemoteDataSourceWriter<W: tokio::io::AsyncWrite> {
    /// The task containing the put request, and the inner writer, if we're still writing.
    task_and_writer: Option<(JoinHandle<Result<(), Error>>, W)>,
    committed: bool,
}

impl<W: tokio::io::AsyncWrite> Drop for RemoteDataSourceWriter<W> {
    fn drop(&mut self) {
        // an aborted request never commits on the server.
        if let Some((task, _)) = self.task_and_writer.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl<W> DataSourceWriter for RemoteDataSourceWriter<W>
where
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    async fn close(&mut self) -> Result<(), Error> {
        let Some((task, mut writer)) = self.task_and_writer.take() else {
            return if self.committed {
                Ok(())
            } else {
                Err(Error::IllegalState(
                    "previously closed with error".to_string(),
                ))
            };
        };

        // invoke shutdown, so the inner writer closes its internal tx side of
        // the channel, which ends the request body.
        let shutdown = writer.shutdown().await;

        // block on the request to return. An error of the server is more
        // interesting than the broken pipe it causes on our side.
        task.await??;
        shutdown?;

        self.committed = true;
        Ok(())
    }
}

impl<W: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for RemoteDataSourceWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match &mut self.task_and_writer {
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "already closed",
            ))),
            Some((_, ref mut writer)) => pin!(writer).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.task_and_writer {
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "already closed",
            ))),
            Some((_, ref mut writer)) => pin!(writer).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        // nothing becomes visible before close.
        Poll::Ready(Ok(()))
    }
}
