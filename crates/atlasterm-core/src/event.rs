/// Notifications the render engine posts back to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The window title should be refreshed from the host's model.
    TitleChanged,
    /// Backend resources were recreated; any bound surface must be rebound.
    SurfaceRecreated,
}
