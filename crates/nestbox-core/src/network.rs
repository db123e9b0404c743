//! Renaming of network interfaces delegated into the container.
//!
//! The supervisor moves host-created interfaces into the network namespace
//! before the first handshake round. Inside, they are renamed to `eth0`,
//! `eth1`, ... in the order given and brought up.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use libc::{c_char, c_short};
use nestbox_common::error::{NestboxError, Result};
use nix::errno::Errno;

/// Name of the loopback interface.
pub const LOOPBACK: &str = "lo";

/// Link-level interface operations.
pub trait InterfaceControl {
    /// Renames interface `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface does not exist or the name is taken.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Sets or clears the administrative up flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface flags cannot be changed.
    fn set_online(&self, name: &str, online: bool) -> Result<()>;
}

/// Renames `interfaces[i]` to `eth{i}` and brings each one up.
///
/// Loopback is brought up afterwards when any interface was given or private
/// networking is on. Without either there is nothing to route, so `lo` is
/// left alone.
///
/// # Errors
///
/// Returns the first rename or link error.
pub fn rename_and_enable(
    ctl: &dyn InterfaceControl,
    private_network: bool,
    interfaces: &[String],
) -> Result<()> {
    for (i, name) in interfaces.iter().enumerate() {
        let new_name = format!("eth{i}");
        tracing::debug!(from = %name, to = %new_name, "renaming interface");
        ctl.rename(name, &new_name)?;

        tracing::debug!(name = %new_name, "enabling interface");
        ctl.set_online(&new_name, true)?;
    }

    if !interfaces.is_empty() || private_network {
        ctl.set_online(LOOPBACK, true)?;
    }
    Ok(())
}

/// [`InterfaceControl`] using `SIOCSIFNAME` / `SIOCSIFFLAGS` on a datagram
/// socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

#[repr(C)]
struct IfReq {
    name: [c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

#[repr(C)]
union IfReqData {
    flags: c_short,
    new_name: [c_char; libc::IFNAMSIZ],
    // the kernel's ifreq union is as large as a struct ifmap
    _pad: [u8; 24],
}

impl IfReq {
    fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: encode_name(name)?,
            data: IfReqData { _pad: [0; 24] },
        })
    }
}

fn encode_name(name: &str) -> Result<[c_char; libc::IFNAMSIZ]> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains('\0') {
        return Err(NestboxError::config(format!(
            "invalid interface name '{name}'"
        )));
    }
    let mut out = [0 as c_char; libc::IFNAMSIZ];
    for (dst, src) in out.iter_mut().zip(name.bytes()) {
        *dst = src as c_char;
    }
    Ok(out)
}

impl SystemInterfaces {
    fn control_socket() -> Result<OwnedFd> {
        // SAFETY: plain socket(2) call; the returned descriptor is owned
        // below.
        let fd = Errno::result(unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0)
        })
        .map_err(|e| NestboxError::syscall("unable to open control socket", e))?;
        // SAFETY: `fd` was just returned by socket(2) and is not owned
        // elsewhere.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn ioctl(sock: &OwnedFd, request: libc::c_ulong, req: &mut IfReq, what: &str) -> Result<()> {
        // SAFETY: `req` is a properly sized, initialised ifreq for the
        // interface requests used in this module.
        Errno::result(unsafe { libc::ioctl(sock.as_raw_fd(), request as _, req as *mut IfReq) })
            .map(drop)
            .map_err(|e| NestboxError::syscall(what.to_string(), e))
    }
}

impl InterfaceControl for SystemInterfaces {
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let sock = Self::control_socket()?;
        let mut req = IfReq::new(from)?;
        req.data.new_name = encode_name(to)?;
        Self::ioctl(
            &sock,
            libc::SIOCSIFNAME as libc::c_ulong,
            &mut req,
            &format!("unable to rename '{from}' to '{to}'"),
        )
    }

    fn set_online(&self, name: &str, online: bool) -> Result<()> {
        let sock = Self::control_socket()?;
        let mut req = IfReq::new(name)?;
        Self::ioctl(
            &sock,
            libc::SIOCGIFFLAGS as libc::c_ulong,
            &mut req,
            &format!("cannot get interface flags on '{name}'"),
        )?;

        // SAFETY: SIOCGIFFLAGS filled in the flags member.
        let flags = unsafe { req.data.flags };
        let up = libc::IFF_UP as c_short;
        req.data.flags = if online { flags | up } else { flags & !up };

        Self::ioctl(
            &sock,
            libc::SIOCSIFFLAGS as libc::c_ulong,
            &mut req,
            &format!("cannot set interface flags on '{name}'"),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct FakeLinks {
        links: RefCell<BTreeMap<String, bool>>,
        ops: RefCell<Vec<String>>,
    }

    impl FakeLinks {
        fn with(names: &[&str]) -> Self {
            let fake = Self::default();
            for name in names {
                let _ = fake.links.borrow_mut().insert((*name).to_string(), false);
            }
            fake
        }

        fn is_up(&self, name: &str) -> bool {
            self.links.borrow().get(name).copied().unwrap_or(false)
        }
    }

    impl InterfaceControl for FakeLinks {
        fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.ops.borrow_mut().push(format!("rename {from} {to}"));
            let mut links = self.links.borrow_mut();
            let state = links
                .remove(from)
                .ok_or_else(|| NestboxError::syscall(format!("no {from}"), Errno::ENODEV))?;
            let _ = links.insert(to.to_string(), state);
            Ok(())
        }

        fn set_online(&self, name: &str, online: bool) -> Result<()> {
            self.ops.borrow_mut().push(format!("up {name}"));
            let mut links = self.links.borrow_mut();
            let state = links
                .get_mut(name)
                .ok_or_else(|| NestboxError::syscall(format!("no {name}"), Errno::ENODEV))?;
            *state = online;
            Ok(())
        }
    }

    #[test]
    fn interfaces_become_eth_in_order_with_loopback() {
        let links = FakeLinks::with(&["lo", "vnet0", "vnet1"]);
        let names = vec!["vnet0".to_string(), "vnet1".to_string()];

        rename_and_enable(&links, false, &names).unwrap();

        assert!(links.is_up("eth0"));
        assert!(links.is_up("eth1"));
        assert!(links.is_up("lo"));
        assert!(!links.links.borrow().contains_key("vnet0"));
        assert_eq!(
            *links.ops.borrow(),
            vec![
                "rename vnet0 eth0",
                "up eth0",
                "rename vnet1 eth1",
                "up eth1",
                "up lo",
            ]
        );
    }

    #[test]
    fn nothing_to_do_leaves_loopback_down() {
        let links = FakeLinks::with(&["lo"]);
        rename_and_enable(&links, false, &[]).unwrap();
        assert!(!links.is_up("lo"));
        assert!(links.ops.borrow().is_empty());
    }

    #[test]
    fn private_network_enables_loopback_alone() {
        let links = FakeLinks::with(&["lo"]);
        rename_and_enable(&links, true, &[]).unwrap();
        assert!(links.is_up("lo"));
    }

    #[test]
    fn missing_interface_aborts() {
        let links = FakeLinks::with(&["lo"]);
        let err = rename_and_enable(&links, false, &["vnet7".to_string()]).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENODEV));
        assert!(!links.is_up("lo"));
    }

    #[test]
    fn interface_names_are_bounded() {
        assert!(encode_name("eth0").is_ok());
        assert!(encode_name("").is_err());
        assert!(encode_name("a-very-long-interface-name").is_err());
    }
}
