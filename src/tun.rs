use std::future::Future;
use std::io;

/// 收发原始 IP 报文的设备
pub trait PacketDevice: Send + Sync {
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    fn send<'a>(&'a self, packet: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

#[cfg(target_os = "linux")]
mod linux {
    use super::PacketDevice;
    use log::info;
    use std::fs::{File, OpenOptions};
    use std::future::Future;
    use std::io::{self, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;

    const TUN_PATH: &str = "/dev/net/tun";
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// 附着到已创建的 tun 设备，不负责创建设备和配置路由
    pub struct TunDevice {
        fd: AsyncFd<File>,
        name: String,
    }

    impl TunDevice {
        pub fn attach(name: &str) -> io::Result<Self> {
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("无效的 tun 设备名: {:?}", name),
                ));
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                .open(TUN_PATH)?;

            let mut req = IfReq {
                name: [0; libc::IFNAMSIZ],
                flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
                *dst = src as libc::c_char;
            }

            // SAFETY: fd 有效，req 按内核 struct ifreq 布局且在调用期间存活
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            info!("✅ 已附着 tun 设备: {}", name);
            Ok(Self {
                fd: AsyncFd::new(file)?,
                name: name.to_string(),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    impl PacketDevice for TunDevice {
        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            async move {
                loop {
                    let mut guard = self.fd.readable().await?;
                    match guard.try_io(|inner| inner.get_ref().read(buf)) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            }
        }

        fn send<'a>(
            &'a self,
            packet: &'a [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            async move {
                loop {
                    let mut guard = self.fd.writable().await?;
                    match guard.try_io(|inner| inner.get_ref().write(packet)) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            }
        }
    }

}

#[cfg(not(target_os = "linux"))]
pub struct TunDevice;

#[cfg(not(target_os = "linux"))]
impl TunDevice {
    pub fn attach(_name: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "tun 设备仅支持 Linux",
        ))
    }
}

#[cfg(not(target_os = "linux"))]
impl PacketDevice for TunDevice {
    fn recv<'a>(
        &'a self,
        _buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async { Err(io::ErrorKind::Unsupported.into()) }
    }

    fn send<'a>(&'a self, _packet: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async { Err(io::ErrorKind::Unsupported.into()) }
    }
}
