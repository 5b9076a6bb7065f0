//! 依赖探测
//!
//! 每种探测类型一个处理函数。超时由调用方统一施加

use std::time::Duration;

use keel_config::ProbeTarget;
use tokio::net::TcpStream;
use tonic::Code;
use tonic::transport::Endpoint;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::debug;

/// 执行一次探测，失败时返回错误描述
pub async fn probe(
    target: &ProbeTarget,
    timeout: Duration,
    http: &reqwest::Client,
) -> Result<(), String> {
    match target {
        ProbeTarget::Tcp { address } => probe_tcp(address).await,
        ProbeTarget::Http { url } => probe_http(http, url).await,
        ProbeTarget::Grpc { address, service } => probe_grpc(address, service, timeout).await,
    }
}

async fn probe_tcp(address: &str) -> Result<(), String> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| format!("dial failed: {e}"))?;
    drop(stream);
    Ok(())
}

async fn probe_http(http: &reqwest::Client, url: &str) -> Result<(), String> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status {status}"))
    }
}

/// grpc.health.v1 检查
///
/// 服务器未注册健康服务（UNIMPLEMENTED）时按传输层可达处理
async fn probe_grpc(address: &str, service: &str, timeout: Duration) -> Result<(), String> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };

    let channel = Endpoint::from_shared(uri)
        .map_err(|e| format!("invalid address: {e}"))?
        .connect_timeout(timeout)
        .connect()
        .await
        .map_err(|e| format!("dial failed: {e}"))?;

    let mut client = HealthClient::new(channel);
    let request = HealthCheckRequest {
        service: service.to_string(),
    };

    match client.check(request).await {
        Ok(response) => {
            let status = response.into_inner().status;
            if status == ServingStatus::Serving as i32 {
                Ok(())
            } else {
                let name = ServingStatus::try_from(status)
                    .map(|s| s.as_str_name())
                    .unwrap_or("UNKNOWN");
                Err(format!("health status {name}"))
            }
        }
        Err(status) if status.code() == Code::Unimplemented => {
            debug!(address = %address, "gRPC health service not registered, treating as reachable");
            Ok(())
        }
        Err(status) => Err(format!("health check failed: {}", status.message())),
    }
}
