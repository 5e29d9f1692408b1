use crate::surface::{BufferId, Health, Location};

/// Receives a notification after every health transition of a buffer location.
///
/// Notifications are fire-and-forget and are delivered while the manager lock
/// is held, so implementations must not call back into the manager.
pub trait SurfaceListener: Send {
    fn health_changed(&self, buffer: BufferId, location: Location, health: Health);
}

impl<F> SurfaceListener for F
where
    F: Fn(BufferId, Location, Health) + Send,
{
    fn health_changed(&self, buffer: BufferId, location: Location, health: Health) {
        self(buffer, location, health);
    }
}

pub(crate) fn notify(
    listeners: &[Box<dyn SurfaceListener>],
    buffer: BufferId,
    location: Location,
    health: Health,
) {
    log::trace!("buffer {buffer}: {location} -> {health:?}");
    for listener in listeners {
        listener.health_changed(buffer, location, health);
    }
}
