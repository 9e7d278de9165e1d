//! 网络地址工具
//!
//! 提供默认宣告地址探测和空闲 TCP 端口探测，
//! 服务实例在未显式配置 host/port 时使用这里的默认值。

use std::net::{IpAddr, TcpListener, UdpSocket};

use rand::Rng;

use crate::error::{ArgusError, Result};

/// 可注册端口下界
pub const PORT_RANGE_MIN: u16 = 1024;

/// 可注册端口上界
pub const PORT_RANGE_MAX: u16 = 65535;

/// 返回本机默认宣告地址
///
/// 通过连接公网地址的 UDP socket 读取默认路由对应的本机 IPv4，
/// 不会产生真实流量；探测失败时回退到回环地址。
pub fn default_host() -> String {
    match default_route_ipv4() {
        Some(ip) => ip.to_string(),
        None => "127.0.0.1".to_string(),
    }
}

fn default_route_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(IpAddr::V4(v4)),
        _ => None,
    }
}

/// 在 [1024, 65535] 内随机探测一个空闲 TCP 端口
pub fn available_port() -> Result<u16> {
    available_port_in(PORT_RANGE_MIN, PORT_RANGE_MAX)
}

/// 在 [min, max] 内随机探测一个空闲 TCP 端口
pub fn available_port_in(min: u16, max: u16) -> Result<u16> {
    if min == 0 {
        return Err(ArgusError::configuration("'min' port must be greater than 0"));
    }
    if max < min {
        return Err(ArgusError::configuration(
            "'max' port must be greater than or equal to 'min' port",
        ));
    }

    let port_range = (max - min) as u32;
    let mut rng = rand::thread_rng();
    let mut search_counter = 0u32;
    loop {
        search_counter += 1;
        if search_counter > port_range + 1 {
            return Err(ArgusError::configuration(format!(
                "could not find an available tcp port in the range [{}, {}] after {} attempts",
                min, max, search_counter
            )));
        }
        let candidate = rng.gen_range(min..=max);
        if port_available(candidate) {
            return Ok(candidate);
        }
    }
}

fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
