//! Gang coordination boundary.
//!
//! Several cameras can be ganged so that their images are combined into one
//! output stream. One driver is the coordinator and collects images from its
//! own camera and from peers; the others are peers and forward every finished
//! image. The transport between them is outside this crate: only the call
//! interface lives here.

use serde::{Deserialize, Serialize};

use crate::image::Image;
use crate::sdk::{ImageMode, TriggerMode};

/// What the coordinator did with an offered image.
#[derive(Debug)]
pub enum Offer {
    /// Taken over; it will come back through `make_complete_images`.
    Consumed,
    /// Not wanted. The caller delivers the image itself.
    Declined(Image),
}

/// Peer acquisition settings the coordinator needs to assemble images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub port_name: String,
    pub width: u32,
    pub height: u32,
    pub trigger_mode: TriggerMode,
    pub image_mode: ImageMode,
    pub num_images: u32,
    pub num_exposures: u32,
    pub exposure: f64,
    pub period: f64,
}

/// Server side, owned by the coordinating driver.
pub trait GangCoordinator: Send {
    /// Offer one of this camera's finished images. `index` is its position in
    /// the acquisition.
    fn offer(&mut self, index: u32, image: Image) -> Offer;

    /// Hand over every image that is now complete, in delivery order.
    fn make_complete_images(&mut self, deliver: &mut dyn FnMut(Image));
}

/// Client side, owned by a peer driver.
pub trait GangPeer: Send {
    fn send_image(&mut self, image: &Image, index: u32);
    fn send_member_config(&mut self, config: &MemberConfig);
}

#[derive(Default)]
pub enum GangRole {
    #[default]
    None,
    Coordinator(Box<dyn GangCoordinator>),
    Peer(Box<dyn GangPeer>),
}

impl GangRole {
    /// Give the coordinator a chance to take the image.
    pub fn offer(&mut self, index: u32, image: Image) -> Offer {
        match self {
            GangRole::Coordinator(coordinator) => coordinator.offer(index, image),
            _ => Offer::Declined(image),
        }
    }

    /// Forward a copy to the coordinator when running as a peer.
    pub fn forward(&mut self, image: &Image, index: u32) {
        if let GangRole::Peer(peer) = self {
            peer.send_image(image, index);
        }
    }

    pub fn send_member_config(&mut self, config: &MemberConfig) {
        if let GangRole::Peer(peer) = self {
            peer.send_member_config(config);
        }
    }

    pub fn make_complete_images(&mut self, deliver: &mut dyn FnMut(Image)) {
        if let GangRole::Coordinator(coordinator) = self {
            coordinator.make_complete_images(deliver);
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, GangRole::Coordinator(_))
    }
}

impl std::fmt::Debug for GangRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GangRole::None => f.write_str("None"),
            GangRole::Coordinator(_) => f.write_str("Coordinator"),
            GangRole::Peer(_) => f.write_str("Peer"),
        }
    }
}
