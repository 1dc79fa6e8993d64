//! 本机局域网地址查找

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// 用于选路的公网地址（UDP connect 不会真正发送数据）
const ROUTE_CHECK_ADDR: &str = "8.8.8.8:80";

/// 获取本机对外的 IP 地址
///
/// 依次尝试：UDP connect 读取本端地址 → 解析本机主机名 → 回环地址。
/// 从不失败。
pub fn local_address() -> String {
    outbound_route_address()
        .or_else(resolve_hostname)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

fn outbound_route_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).ok()?;
    let _ = socket.set_read_timeout(Some(Duration::from_secs(2)));
    socket.connect(ROUTE_CHECK_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    usable(ip).then_some(ip)
}

fn resolve_hostname() -> Option<IpAddr> {
    let name = hostname::get().ok()?;
    let name = name.to_str()?;
    (name, 0)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && usable(*ip))
}

fn usable(ip: IpAddr) -> bool {
    !ip.is_unspecified() && !ip.is_loopback()
}
