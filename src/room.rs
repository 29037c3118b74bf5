//! Canvas rooms: per-canvas state and the process-wide registry.
//!
//! A room owns one canvas's runtime state — the ordered layer stack, the
//! reliable subscribers, the unreliable peer set, and the user table —
//! behind a single mutex. Session tasks and the room's datagram worker
//! take that mutex for every mutation, and broadcasts are emitted inside
//! the same critical section so no subscriber can observe a mutation
//! before its echo.
//!
//! Rooms are created on demand (first login or a document load) and become
//! Active once their UDP socket binds and the worker task starts; socket
//! and worker then outlive individual sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::brush::BrushCatalog;
use crate::codec::Pixel;
use crate::layer::{self, Layer};
use crate::protocol::{Datagram, Frame, SIGNATURE_LEN};
use crate::MAX_LAYERS;

/// One connected participant, keyed by its reliable connection id.
pub struct User {
    pub name: String,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
    pub room_uid: u8,
}

/// Everything a room guards under its mutex.
pub struct RoomState {
    layers: Vec<Layer>,
    subscribers: HashMap<Uuid, UnboundedSender<Arc<Vec<u8>>>>,
    peers: Vec<SocketAddr>,
    users: HashMap<Uuid, User>,
    pub(crate) dirty: bool,
}

impl RoomState {
    fn new() -> Self {
        Self {
            layers: vec![Layer::white(), Layer::transparent()],
            subscribers: HashMap::new(),
            peers: Vec::new(),
            users: HashMap::new(),
            dirty: true,
        }
    }

    pub fn layer_count(&self) -> u8 {
        self.layers.len() as u8
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut Vec<Layer> {
        &mut self.layers
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn user_uid(&self, conn: &Uuid) -> Option<u8> {
        self.users.get(conn).map(|u| u.room_uid)
    }

    /// Register a subscriber and assign the smallest free room uid in
    /// `1..=255`. Returns `None` when every uid is taken.
    pub fn join(
        &mut self,
        conn: Uuid,
        name: String,
        sender: UnboundedSender<Arc<Vec<u8>>>,
    ) -> Option<(u8, u8)> {
        let mut used = [false; 256];
        for user in self.users.values() {
            used[user.room_uid as usize] = true;
        }
        let room_uid = (1..=255u8).find(|&uid| !used[uid as usize])?;
        self.users.insert(
            conn,
            User {
                name,
                signature: None,
                room_uid,
            },
        );
        self.subscribers.insert(conn, sender);
        Some((room_uid, self.layer_count()))
    }

    /// Drop a subscriber and its user record. The unreliable peer set is
    /// deliberately untouched.
    pub fn leave(&mut self, conn: &Uuid) -> Option<User> {
        self.subscribers.remove(conn);
        self.users.remove(conn)
    }

    /// Store a signature payload verbatim; returns the owner's room uid.
    pub fn set_signature(&mut self, conn: &Uuid, payload: [u8; SIGNATURE_LEN]) -> Option<u8> {
        let user = self.users.get_mut(conn)?;
        user.signature = Some(payload);
        Some(user.room_uid)
    }

    /// Stored signatures of every user other than `conn`, for forwarding
    /// to a fresh login.
    pub fn signatures_of_others(&self, conn: &Uuid) -> Vec<(u8, [u8; SIGNATURE_LEN])> {
        self.users
            .iter()
            .filter(|(id, _)| *id != conn)
            .filter_map(|(_, user)| user.signature.map(|s| (user.room_uid, s)))
            .collect()
    }

    /// Insert a fresh transparent layer. An index strictly inside the
    /// drawable range inserts there; zero or past-the-end appends.
    /// Returns `(new_total, inserted_index)`, or `None` at capacity.
    pub fn add_layer(&mut self, at: u8) -> Option<(u8, u8)> {
        if self.layers.len() >= MAX_LAYERS {
            return None;
        }
        let index = if at >= 1 && (at as usize) < self.layers.len() {
            self.layers.insert(at as usize, Layer::transparent());
            at
        } else {
            self.layers.push(Layer::transparent());
            (self.layers.len() - 1) as u8
        };
        self.dirty = true;
        Some((self.layer_count(), index))
    }

    /// Remove a drawable layer. The paper and the last drawable are
    /// protected; invalid requests are a no-op.
    pub fn delete_layer(&mut self, index: u8) -> Option<u8> {
        let i = index as usize;
        if i < 1 || i >= self.layers.len() || self.layers.len() <= 2 {
            return None;
        }
        self.layers.remove(i);
        self.dirty = true;
        Some(self.layer_count())
    }

    /// Move layer `from` to position `to` by rotating the span between
    /// them. Both must be drawable indices.
    pub fn reorder_layer(&mut self, from: u8, to: u8) -> bool {
        let (from, to) = (from as usize, to as usize);
        let len = self.layers.len();
        if from < 1 || from >= len || to < 1 || to >= len || from == to {
            return false;
        }
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        self.dirty = true;
        true
    }

    /// Overwrite a drawable layer's bitmap from a `LAYER_SYNC` payload.
    pub fn replace_layer(&mut self, index: u8, bytes: &[u8]) -> bool {
        let i = index as usize;
        if i < 1 || i >= self.layers.len() {
            return false;
        }
        if !self.layers[i].replace(bytes) {
            return false;
        }
        self.dirty = true;
        true
    }

    /// Translate a drawable layer's content by `(dx, dy)`.
    pub fn translate_layer(&mut self, index: u8, dx: i32, dy: i32) -> bool {
        let i = index as usize;
        if i < 1 || i >= self.layers.len() {
            return false;
        }
        self.layers[i].translate(dx, dy);
        self.dirty = true;
        true
    }

    /// Apply one brush stamp to a drawable layer. Out-of-range layer ids
    /// fall back to layer 1; unknown brushes drop the packet.
    #[allow(clippy::too_many_arguments)]
    pub fn stamp(
        &mut self,
        catalog: &BrushCatalog,
        brush_id: u8,
        layer_id: u8,
        x: i32,
        y: i32,
        color: Pixel,
        size: u8,
        pressure: u8,
        angle: i32,
    ) {
        if layer::apply_stamp(
            &mut self.layers,
            catalog,
            brush_id,
            layer_id,
            x,
            y,
            color,
            size,
            pressure,
            angle,
        ) {
            self.dirty = true;
        }
    }

    /// Rasterize a line with the integer Bresenham trajectory, stamping
    /// at every point. The per-stamp angle is derived from the endpoints.
    #[allow(clippy::too_many_arguments)]
    pub fn stroke_line(
        &mut self,
        catalog: &BrushCatalog,
        brush_id: u8,
        layer_id: u8,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        color: Pixel,
        size: u8,
        pressure: u8,
    ) {
        if layer::apply_line(
            &mut self.layers,
            catalog,
            brush_id,
            layer_id,
            x0,
            y0,
            x1,
            y1,
            color,
            size,
            pressure,
        ) {
            self.dirty = true;
        }
    }

    /// Queue a frame to every subscriber, optionally excluding one.
    /// Enqueue failures mean the peer's writer already died; its own
    /// session task will clean up.
    pub fn broadcast_frame(&self, frame: &Frame, exclude: Option<&Uuid>) {
        self.broadcast_bytes(Arc::new(frame.encode().to_vec()), exclude);
    }

    pub fn broadcast_bytes(&self, bytes: Arc<Vec<u8>>, exclude: Option<&Uuid>) {
        for (conn, sender) in &self.subscribers {
            if exclude == Some(conn) {
                continue;
            }
            let _ = sender.send(bytes.clone());
        }
    }

    /// Queue bytes to a single subscriber.
    pub fn send_to(&self, conn: &Uuid, bytes: Arc<Vec<u8>>) {
        if let Some(sender) = self.subscribers.get(conn) {
            let _ = sender.send(bytes);
        }
    }

    /// Record a datagram sender, returning true the first time an
    /// endpoint is seen. The peer set only grows.
    pub fn note_peer(&mut self, addr: SocketAddr) -> bool {
        if self.peers.contains(&addr) {
            return false;
        }
        self.peers.push(addr);
        true
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Fan a datagram out to every known peer except the sender.
    /// Per-peer send failures are ignored.
    pub fn rebroadcast_datagram(&self, socket: &UdpSocket, packet: &Datagram, sender: SocketAddr) {
        let payload = packet.encode();
        for peer in &self.peers {
            if *peer != sender {
                let _ = socket.try_send_to(&payload, *peer);
            }
        }
    }
}

/// Server-side object owning one canvas's runtime state.
pub struct Room {
    pub id: u8,
    state: Mutex<RoomState>,
    /// Serializes first-login activation. Separate from `state` so the
    /// socket bind never happens under the room state mutex.
    activation: Mutex<()>,
    active: AtomicBool,
    socket: OnceLock<Arc<UdpSocket>>,
    udp_port: OnceLock<u16>,
}

impl Room {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::new()),
            activation: Mutex::new(()),
            active: AtomicBool::new(false),
            socket: OnceLock::new(),
            udp_port: OnceLock::new(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    /// Take the activation lock while checking/binding the room's
    /// datagram socket.
    pub(crate) async fn activation_guard(&self) -> MutexGuard<'_, ()> {
        self.activation.lock().await
    }

    /// Whether the room's datagram worker is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Record the bound socket and flip the room Active. Called exactly
    /// once, before the worker task is spawned.
    pub(crate) fn set_active(&self, socket: Arc<UdpSocket>, port: u16) {
        let _ = self.socket.set(socket);
        let _ = self.udp_port.set(port);
        self.active.store(true, Ordering::Release);
    }

    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.get().cloned()
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp_port.get().copied()
    }
}

/// Process-wide map from canvas id to room, with on-demand creation.
pub struct RoomRegistry {
    rooms: RwLock<std::collections::BTreeMap<u8, Arc<Room>>>,
    /// Serializes whole-document persistence passes (autosave vs.
    /// explicit SAVE) so two writers never race on the same file.
    persist_lock: Mutex<()>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(std::collections::BTreeMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Take the persistence lock for the duration of a save pass.
    pub async fn persist_guard(&self) -> MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }

    /// Fetch a room, creating it (paper + one drawable) on first
    /// reference.
    pub async fn get_or_create(&self, id: u8) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(&id) {
            return room.clone();
        }
        log::info!("creating canvas #{id} on demand");
        let room = Arc::new(Room::new(id));
        rooms.insert(id, room.clone());
        room
    }

    pub async fn get(&self, id: u8) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&id).cloned()
    }

    /// All rooms in ascending canvas-id order.
    pub async fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, WriteMode};
    use tokio::sync::mpsc;

    fn subscriber() -> UnboundedSender<Arc<Vec<u8>>> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_new_room_has_paper_and_one_drawable() {
        let state = RoomState::new();
        assert_eq!(state.layer_count(), 2);
        assert_eq!(state.layers()[0].pixel(0, 0), Some(Pixel::WHITE));
        assert_eq!(state.layers()[1].pixel(0, 0), Some(Pixel::TRANSPARENT));
        assert!(state.dirty);
    }

    #[test]
    fn test_uid_assignment_reuses_smallest_free() {
        let mut state = RoomState::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_eq!(state.join(a, "a".into(), subscriber()).unwrap().0, 1);
        assert_eq!(state.join(b, "b".into(), subscriber()).unwrap().0, 2);
        assert_eq!(state.join(c, "c".into(), subscriber()).unwrap().0, 3);

        state.leave(&b);
        let d = Uuid::new_v4();
        assert_eq!(state.join(d, "d".into(), subscriber()).unwrap().0, 2);
    }

    #[test]
    fn test_subscribers_and_users_share_keys() {
        let mut state = RoomState::new();
        let conn = Uuid::new_v4();
        state.join(conn, "x".into(), subscriber());
        assert_eq!(state.subscriber_count(), 1);
        assert!(state.user_uid(&conn).is_some());
        state.leave(&conn);
        assert_eq!(state.subscriber_count(), 0);
        assert!(state.user_uid(&conn).is_none());
    }

    #[test]
    fn test_add_layer_insert_and_append() {
        let mut state = RoomState::new();
        // Append when the index is zero or past the end.
        assert_eq!(state.add_layer(0), Some((3, 2)));
        assert_eq!(state.add_layer(200), Some((4, 3)));
        // Insert when strictly inside the drawable range.
        assert_eq!(state.add_layer(1), Some((5, 1)));
    }

    #[test]
    fn test_add_layer_capacity() {
        let mut state = RoomState::new();
        while state.layer_count() < MAX_LAYERS as u8 {
            state.add_layer(0).unwrap();
        }
        assert_eq!(state.add_layer(0), None);
        assert_eq!(state.layer_count(), MAX_LAYERS as u8);
    }

    #[test]
    fn test_delete_layer_guards() {
        let mut state = RoomState::new();
        // Paper and the last drawable are protected.
        assert_eq!(state.delete_layer(0), None);
        assert_eq!(state.delete_layer(1), None);
        state.add_layer(0);
        assert_eq!(state.delete_layer(1), Some(2));
        assert_eq!(state.delete_layer(5), None);
    }

    #[test]
    fn test_reorder_layer_rotates() {
        let mut state = RoomState::new();
        state.add_layer(0);
        state.add_layer(0);
        state.layers_mut()[1].write(0, 0, Pixel::rgba(1, 0, 0, 255), WriteMode::Replace);
        state.layers_mut()[3].write(0, 0, Pixel::rgba(3, 0, 0, 255), WriteMode::Replace);
        assert!(state.reorder_layer(1, 3));
        assert_eq!(state.layers()[3].pixel(0, 0), Some(Pixel::rgba(1, 0, 0, 255)));
        assert_eq!(state.layers()[2].pixel(0, 0), Some(Pixel::rgba(3, 0, 0, 255)));
        assert!(!state.reorder_layer(0, 1));
        assert!(!state.reorder_layer(1, 1));
    }

    #[test]
    fn test_stamp_clamps_layer_id() {
        let catalog = BrushCatalog::standard();
        let mut state = RoomState::new();
        let black = Pixel::rgba(0, 0, 0, 255);
        // Layer 9 does not exist: the stamp lands on layer 1.
        state.stamp(&catalog, 0, 9, 50, 50, black, 1, 255, 0);
        assert_eq!(state.layers()[1].pixel(50, 50), Some(black));
    }

    #[test]
    fn test_stamp_unknown_brush_dropped() {
        let catalog = BrushCatalog::standard();
        let mut state = RoomState::new();
        state.stamp(&catalog, 99, 1, 50, 50, Pixel::WHITE, 5, 255, 0);
        assert_eq!(state.layers()[1].pixel(50, 50), Some(Pixel::TRANSPARENT));
    }

    #[test]
    fn test_line_equals_point_sequence() {
        let catalog = BrushCatalog::standard();
        let black = Pixel::rgba(0, 0, 0, 255);

        let mut lined = RoomState::new();
        lined.stroke_line(&catalog, 0, 1, 0, 0, 10, 5, black, 1, 255);

        let mut stamped = RoomState::new();
        for (x, y) in codec::LinePoints::new(0, 0, 10, 5) {
            stamped.stamp(&catalog, 0, 1, x, y, black, 1, 255, 0);
        }

        assert_eq!(lined.layers()[1].bytes(), stamped.layers()[1].bytes());
    }

    #[test]
    fn test_eraser_stamp_uses_its_mode() {
        let catalog = BrushCatalog::standard();
        let mut state = RoomState::new();
        let red = Pixel::rgba(255, 0, 0, 255);
        state.stamp(&catalog, 1, 1, 50, 50, red, 20, 255, 0);
        state.stamp(&catalog, 2, 1, 50, 50, red, 4, 255, 0);
        assert_eq!(state.layers()[1].pixel(50, 50), Some(Pixel::TRANSPARENT));
        assert_eq!(state.layers()[1].pixel(58, 58), Some(red));
    }

    #[test]
    fn test_note_peer_grows_once() {
        let mut state = RoomState::new();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(state.note_peer(addr));
        assert!(!state.note_peer(addr));
        assert_eq!(state.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_returns_same_room() {
        let registry = RoomRegistry::new();
        let first = registry.get_or_create(4).await;
        let second = registry.get_or_create(4).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.get(5).await.is_none());
    }

    #[tokio::test]
    async fn test_room_starts_inactive() {
        let room = Room::new(0);
        assert!(!room.is_active());
        assert!(room.udp_socket().is_none());
        assert!(room.udp_port().is_none());
    }
}
