use crate::flow::{now_timestamp, Flow, FlowRequest, FlowResponse, Headers};
use crate::interceptor::{HookOutcome, Interceptor};
use crate::registry::Verdict;
use hudsucker::{
    hyper::{
        self,
        header::{HeaderName, HeaderValue, HOST},
        http::{request, response},
        Body, HeaderMap, Method, Request, Response, StatusCode, Uri,
    },
    decode_request, decode_response, HttpContext, HttpHandler, RequestOrResponse,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const KILLED_BODY: &str = "Flow killed by Syrah";

/// Engine adapter: turns hudsucker's request/response callbacks into the
/// interceptor's lifecycle hooks.
///
/// hudsucker clones the handler for every request and calls both callbacks
/// on the same clone, so the in-flight flow lives in `current`.
#[derive(Clone)]
pub struct FlowHandler {
    interceptor: Interceptor,
    current: Option<Flow>,
}

impl FlowHandler {
    pub fn new(interceptor: Interceptor) -> Self {
        Self {
            interceptor,
            current: None,
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for FlowHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        // bodies are kept decoded; the decoder also drops content-encoding
        let req = match decode_request(req) {
            Ok(req) => req,
            Err(e) => {
                warn!("Failed to decode request body: {}", e);
                return RequestOrResponse::Response(bad_gateway(&e.to_string()));
            }
        };
        let (mut parts, body) = req.into_parts();
        let content = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return RequestOrResponse::Response(bad_gateway(&e.to_string()));
            }
        };

        let Some(request) = flow_request(&parts, &content) else {
            debug!("Passing through request without an absolute URL: {}", parts.uri);
            return RequestOrResponse::Request(Request::from_parts(parts, Body::from(content)));
        };
        let mut flow = Flow::new(Uuid::new_v4().to_string(), request);
        debug!("Request [{}] {} {}", flow.id, flow.request.method, flow.pretty_url());

        match self.interceptor.on_request(&mut flow).await {
            HookOutcome::Continue => {}
            HookOutcome::Hold(pending) => {
                debug!("Request [{}] held, waiting for a verdict", pending.flow_id());
                match pending.wait().await {
                    Verdict::Resume(edits) => flow.resume(edits.as_ref()),
                    Verdict::Kill => return RequestOrResponse::Response(killed(&flow)),
                }
            }
            HookOutcome::Kill => return RequestOrResponse::Response(killed(&flow)),
        }

        apply_request(&mut parts, &flow.request);
        let body = Body::from(flow.request.content.clone());
        self.current = Some(flow);
        RequestOrResponse::Request(Request::from_parts(parts, body))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(mut flow) = self.current.take() else {
            return res;
        };

        let res = match decode_response(res) {
            Ok(res) => res,
            Err(e) => {
                flow.error = Some(e.to_string());
                self.interceptor.on_error(&flow);
                return bad_gateway(&e.to_string());
            }
        };
        let (mut parts, body) = res.into_parts();
        let content = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                flow.error = Some(e.to_string());
                self.interceptor.on_error(&flow);
                return bad_gateway(&e.to_string());
            }
        };
        flow.response = Some(flow_response(&parts, content));

        match self.interceptor.on_response(&mut flow).await {
            HookOutcome::Continue => {}
            HookOutcome::Hold(pending) => {
                debug!("Response [{}] held, waiting for a verdict", pending.flow_id());
                match pending.wait().await {
                    Verdict::Resume(edits) => flow.resume(edits.as_ref()),
                    Verdict::Kill => return killed(&flow),
                }
            }
            HookOutcome::Kill => return killed(&flow),
        }

        let Some(response) = flow.response else {
            return Response::from_parts(parts, Body::empty());
        };
        apply_response(&mut parts, &response);
        Response::from_parts(parts, Body::from(response.content))
    }

    async fn handle_error(&mut self, _ctx: &HttpContext, err: hyper::Error) -> Response<Body> {
        let message = err.to_string();
        match self.current.take() {
            Some(mut flow) => {
                warn!("Flow {} failed upstream: {}", flow.id, message);
                flow.error = Some(message.clone());
                self.interceptor.on_error(&flow);
            }
            None => warn!("Failed to forward request: {}", message),
        }
        bad_gateway(&message)
    }
}

/// Absolute URL of a proxied request. Origin-form requests fall back to the
/// Host header over plain http.
fn request_url(parts: &request::Parts) -> Option<String> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    match (parts.uri.scheme_str(), parts.uri.authority()) {
        (Some(scheme), Some(authority)) => Some(format!("{}://{}{}", scheme, authority, path)),
        _ => {
            let host = parts.headers.get(HOST)?.to_str().ok()?;
            Some(format!("http://{}{}", host, path))
        }
    }
}

fn flow_request(parts: &request::Parts, content: &[u8]) -> Option<FlowRequest> {
    let url = request_url(parts)?;
    let mut request = FlowRequest::from_url(parts.method.as_str(), &url)?;
    request.http_version = format!("{:?}", parts.version);
    request.headers = headers_from(&parts.headers);
    request.content = content.to_vec();
    request.timestamp_end = Some(now_timestamp());
    Some(request)
}

fn flow_response(parts: &response::Parts, content: Vec<u8>) -> FlowResponse {
    let mut response = FlowResponse::synthetic(
        parts.status.as_u16(),
        headers_from(&parts.headers),
        content,
        &format!("{:?}", parts.version),
    );
    if let Some(reason) = parts.status.canonical_reason() {
        response.reason = reason.to_string();
    }
    response
}

fn headers_from(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn write_headers(target: &mut HeaderMap, headers: &Headers) {
    target.clear();
    for (name, value) in headers.iter() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => warn!("Dropping invalid header: {}", name),
        }
    }
}

fn apply_request(parts: &mut request::Parts, request: &FlowRequest) {
    match Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => parts.method = method,
        Err(_) => warn!("Keeping original method, invalid method: {}", request.method),
    }
    let url = request.pretty_url();
    match url.parse::<Uri>() {
        Ok(uri) => parts.uri = uri,
        Err(e) => warn!("Keeping original URI, cannot parse {}: {}", url, e),
    }
    write_headers(&mut parts.headers, &request.headers);
}

fn apply_response(parts: &mut response::Parts, response: &FlowResponse) {
    match StatusCode::from_u16(response.status_code) {
        Ok(status) => parts.status = status,
        Err(e) => warn!("Keeping original status, {}: {}", response.status_code, e),
    }
    write_headers(&mut parts.headers, &response.headers);
}

fn killed(flow: &Flow) -> Response<Body> {
    info!("Flow {} killed: {}", flow.id, flow.pretty_url());
    let mut res = Response::new(Body::from(KILLED_BODY));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

fn bad_gateway(message: &str) -> Response<Body> {
    let mut res = Response::new(Body::from(message.to_string()));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}
