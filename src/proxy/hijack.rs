//! Taking raw ownership of an inbound connection.
//!
//! hyper exposes the underlying transport of an HTTP/1 connection through the
//! `OnUpgrade` request extension, present only when the connection was served
//! with upgrades enabled. Checking for it is the capability test; removing it
//! transfers ownership out of the framing layer, which then hands the socket
//! over once the response head has been written.

use crate::error::{ProxyError, Result};
use hyper::upgrade::OnUpgrade;
use hyper::Request;

/// Whether the connection carrying `req` can be hijacked.
pub fn supports_hijack<B>(req: &Request<B>) -> bool {
    req.extensions().get::<OnUpgrade>().is_some()
}

/// Move the pending upgrade out of the request.
///
/// After this returns, the HTTP layer releases the connection to the holder
/// of the `OnUpgrade` future as soon as the response head is flushed.
pub fn take_upgrade<B>(req: &mut Request<B>) -> Result<OnUpgrade> {
    req.extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(ProxyError::HijackUnsupported)
}
