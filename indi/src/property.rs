//! Property container
//!
//! A [`Property`] is a named vector of widgets that all share one kind.
//! Devices hand out [`PropertyHandle`]s: cheap clones of an
//! `Arc<RwLock<Property>>` that stay valid after the property is removed
//! from its device.

use crate::error::{IndiError, IndiResult};
use crate::number;
use crate::value::{
    BlobWidget, LightWidget, NumberWidget, Permission, PropertyKind, PropertyState, SwitchRule,
    SwitchState, SwitchWidget, TextWidget,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback run by [`Property::emit_update`]
pub type UpdateHook = Arc<dyn Fn(&Property) + Send + Sync>;

/// The widgets of a property; one variant per kind
#[derive(Debug, PartialEq)]
pub enum Widgets {
    Number(Vec<NumberWidget>),
    Switch(Vec<SwitchWidget>),
    Text(Vec<TextWidget>),
    Light(Vec<LightWidget>),
    Blob(Vec<BlobWidget>),
}

impl Widgets {
    pub fn empty(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Number => Widgets::Number(Vec::new()),
            PropertyKind::Switch => Widgets::Switch(Vec::new()),
            PropertyKind::Text => Widgets::Text(Vec::new()),
            PropertyKind::Light => Widgets::Light(Vec::new()),
            PropertyKind::Blob => Widgets::Blob(Vec::new()),
        }
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Widgets::Number(_) => PropertyKind::Number,
            Widgets::Switch(_) => PropertyKind::Switch,
            Widgets::Text(_) => PropertyKind::Text,
            Widgets::Light(_) => PropertyKind::Light,
            Widgets::Blob(_) => PropertyKind::Blob,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Widgets::Number(w) => w.len(),
            Widgets::Switch(w) => w.len(),
            Widgets::Text(w) => w.len(),
            Widgets::Light(w) => w.len(),
            Widgets::Blob(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every widget whose name repeats an earlier one; returns the dropped names
    pub fn dedup_names(&mut self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dropped = Vec::new();
        let mut keep = |name: &str| {
            if seen.insert(name.to_string()) {
                true
            } else {
                dropped.push(name.to_string());
                false
            }
        };
        match self {
            Widgets::Number(w) => w.retain(|x| keep(&x.name)),
            Widgets::Switch(w) => w.retain(|x| keep(&x.name)),
            Widgets::Text(w) => w.retain(|x| keep(&x.name)),
            Widgets::Light(w) => w.retain(|x| keep(&x.name)),
            Widgets::Blob(w) => w.retain(|x| keep(&x.name)),
        }
        dropped
    }

    /// Widget names in order
    pub fn names(&self) -> Vec<&str> {
        match self {
            Widgets::Number(w) => w.iter().map(|x| x.name.as_str()).collect(),
            Widgets::Switch(w) => w.iter().map(|x| x.name.as_str()).collect(),
            Widgets::Text(w) => w.iter().map(|x| x.name.as_str()).collect(),
            Widgets::Light(w) => w.iter().map(|x| x.name.as_str()).collect(),
            Widgets::Blob(w) => w.iter().map(|x| x.name.as_str()).collect(),
        }
    }
}

/// Borrowed view of one widget of any kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WidgetRef<'a> {
    Number(&'a NumberWidget),
    Switch(&'a SwitchWidget),
    Text(&'a TextWidget),
    Light(&'a LightWidget),
    Blob(&'a BlobWidget),
}

impl<'a> WidgetRef<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            WidgetRef::Number(w) => &w.name,
            WidgetRef::Switch(w) => &w.name,
            WidgetRef::Text(w) => &w.name,
            WidgetRef::Light(w) => &w.name,
            WidgetRef::Blob(w) => &w.name,
        }
    }

    pub fn label(&self) -> &'a str {
        match self {
            WidgetRef::Number(w) => &w.label,
            WidgetRef::Switch(w) => &w.label,
            WidgetRef::Text(w) => &w.label,
            WidgetRef::Light(w) => &w.label,
            WidgetRef::Blob(w) => &w.label,
        }
    }
}

/// One widget entry of an update or command element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WidgetUpdate {
    pub name: String,
    /// Element text: number, switch or light state, or text value
    pub value: String,
    pub min: Option<String>,
    pub max: Option<String>,
}

impl WidgetUpdate {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }
    }
}

/// Raw contents of a `setXxxVector`, validated by [`Property::apply_update`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorUpdate {
    pub state: Option<String>,
    pub timeout: Option<String>,
    pub widgets: Vec<WidgetUpdate>,
}

// Parsed widget changes, indexed into the widget vector
enum Pending {
    Number(Vec<(usize, f64, Option<f64>, Option<f64>)>),
    Switch(Vec<(usize, SwitchState)>),
    Text(Vec<(usize, String)>),
    Light(Vec<(usize, PropertyState)>),
    None,
}

/// An INDI property
pub struct Property {
    pub name: String,
    pub device: String,
    pub label: String,
    pub group: String,
    pub permission: Permission,
    pub state: PropertyState,
    /// Advisory, seconds
    pub timeout: f64,
    // false for a ghost entry pre-declared before its definition arrived
    registered: bool,
    /// Built from a skeleton document
    pub dynamic: bool,
    /// Only meaningful for switch vectors
    pub rule: SwitchRule,
    widgets: Widgets,
    update_hook: Option<UpdateHook>,
}

impl Property {
    pub fn new(device: &str, name: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            label: name.to_string(),
            group: String::new(),
            permission: Permission::default(),
            state: PropertyState::default(),
            timeout: 0.0,
            registered: true,
            dynamic: false,
            rule: SwitchRule::default(),
            widgets: Widgets::empty(kind),
            update_hook: None,
        }
    }

    /// A ghost: known shape, not yet defined on the wire
    pub fn ghost(device: &str, name: &str, kind: PropertyKind) -> Self {
        Self {
            registered: false,
            ..Self::new(device, name, kind)
        }
    }

    pub fn kind(&self) -> PropertyKind {
        self.widgets.kind()
    }

    /// False for a ghost entry pre-declared before its definition arrived
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    pub fn widgets(&self) -> &Widgets {
        &self.widgets
    }

    /// Replace the widgets; the kind is fixed when the property is created
    ///
    /// A widget whose name repeats an earlier one is dropped with a warning.
    pub fn set_widgets(&mut self, mut widgets: Widgets) -> IndiResult<()> {
        if widgets.kind() != self.kind() {
            return Err(IndiError::KindMismatch {
                device: self.device.clone(),
                property: self.name.clone(),
                expected: self.kind(),
                found: widgets.kind(),
            });
        }
        for name in widgets.dedup_names() {
            tracing::warn!("{}.{}: dropping duplicate widget {}", self.device, self.name, name);
        }
        self.widgets = widgets;
        Ok(())
    }

    pub fn find_widget(&self, name: &str) -> Option<WidgetRef<'_>> {
        match &self.widgets {
            Widgets::Number(w) => w.iter().find(|x| x.name == name).map(WidgetRef::Number),
            Widgets::Switch(w) => w.iter().find(|x| x.name == name).map(WidgetRef::Switch),
            Widgets::Text(w) => w.iter().find(|x| x.name == name).map(WidgetRef::Text),
            Widgets::Light(w) => w.iter().find(|x| x.name == name).map(WidgetRef::Light),
            Widgets::Blob(w) => w.iter().find(|x| x.name == name).map(WidgetRef::Blob),
        }
    }

    pub fn numbers(&self) -> &[NumberWidget] {
        match &self.widgets {
            Widgets::Number(w) => w,
            _ => &[],
        }
    }

    pub fn switches(&self) -> &[SwitchWidget] {
        match &self.widgets {
            Widgets::Switch(w) => w,
            _ => &[],
        }
    }

    pub fn texts(&self) -> &[TextWidget] {
        match &self.widgets {
            Widgets::Text(w) => w,
            _ => &[],
        }
    }

    pub fn lights(&self) -> &[LightWidget] {
        match &self.widgets {
            Widgets::Light(w) => w,
            _ => &[],
        }
    }

    pub fn blobs(&self) -> &[BlobWidget] {
        match &self.widgets {
            Widgets::Blob(w) => w,
            _ => &[],
        }
    }

    pub fn number_mut(&mut self, name: &str) -> Option<&mut NumberWidget> {
        match &mut self.widgets {
            Widgets::Number(w) => w.iter_mut().find(|x| x.name == name),
            _ => None,
        }
    }

    pub fn switch_mut(&mut self, name: &str) -> Option<&mut SwitchWidget> {
        match &mut self.widgets {
            Widgets::Switch(w) => w.iter_mut().find(|x| x.name == name),
            _ => None,
        }
    }

    pub fn text_mut(&mut self, name: &str) -> Option<&mut TextWidget> {
        match &mut self.widgets {
            Widgets::Text(w) => w.iter_mut().find(|x| x.name == name),
            _ => None,
        }
    }

    pub fn light_mut(&mut self, name: &str) -> Option<&mut LightWidget> {
        match &mut self.widgets {
            Widgets::Light(w) => w.iter_mut().find(|x| x.name == name),
            _ => None,
        }
    }

    pub fn blob_mut(&mut self, name: &str) -> Option<&mut BlobWidget> {
        match &mut self.widgets {
            Widgets::Blob(w) => w.iter_mut().find(|x| x.name == name),
            _ => None,
        }
    }

    pub fn number_value(&self, name: &str) -> Option<f64> {
        self.numbers().iter().find(|w| w.name == name).map(|w| w.value)
    }

    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.texts()
            .iter()
            .find(|w| w.name == name)
            .map(|w| w.text.as_str())
    }

    pub fn switch_state(&self, name: &str) -> Option<SwitchState> {
        self.switches().iter().find(|w| w.name == name).map(|w| w.state)
    }

    /// First switch that is on
    pub fn on_switch(&self) -> Option<&SwitchWidget> {
        self.switches().iter().find(|w| w.is_on())
    }

    /// Set one switch, honouring the vector's rule
    ///
    /// Under `OneOfMany` and `AtMostOne` turning a switch on turns every
    /// other switch off. Returns false if no such switch exists.
    pub fn set_switch(&mut self, name: &str, state: SwitchState) -> bool {
        let exclusive = self.rule != SwitchRule::AnyOfMany && state == SwitchState::On;
        let Widgets::Switch(switches) = &mut self.widgets else {
            return false;
        };
        if !switches.iter().any(|w| w.name == name) {
            return false;
        }
        for w in switches.iter_mut() {
            if w.name == name {
                w.state = state;
            } else if exclusive {
                w.state = SwitchState::Off;
            }
        }
        true
    }

    /// Validate and apply an update
    ///
    /// State and timeout are checked first and every widget value is parsed
    /// before anything is written, so on error the property is untouched.
    /// Widget names the property does not have are ignored. BLOB payloads
    /// are not handled here; only the metadata of a BLOB vector changes.
    pub fn apply_update(&mut self, update: &VectorUpdate) -> IndiResult<()> {
        let state = match &update.state {
            Some(s) => Some(
                PropertyState::parse(s)
                    .map_err(|_| self.state_error(format!("bogus state {:?}", s)))?,
            ),
            None => None,
        };
        let timeout = match &update.timeout {
            Some(t) => {
                let value = number::parse_number(t)
                    .map_err(|_| self.state_error(format!("bogus timeout {:?}", t)))?;
                if value < 0.0 {
                    return Err(self.state_error(format!("negative timeout {}", value)));
                }
                Some(value)
            }
            None => None,
        };

        let pending = self.parse_widget_updates(&update.widgets)?;

        if let Some(state) = state {
            self.state = state;
        }
        if let Some(timeout) = timeout {
            self.timeout = timeout;
        }

        match (pending, &mut self.widgets) {
            (Pending::Number(changes), Widgets::Number(w)) => {
                for (i, value, min, max) in changes {
                    w[i].value = value;
                    if let Some(min) = min {
                        w[i].min = min;
                    }
                    if let Some(max) = max {
                        w[i].max = max;
                    }
                }
            }
            (Pending::Switch(changes), Widgets::Switch(w)) => {
                for (i, state) in changes {
                    w[i].state = state;
                }
            }
            (Pending::Text(changes), Widgets::Text(w)) => {
                for (i, text) in changes {
                    w[i].text = text;
                }
            }
            (Pending::Light(changes), Widgets::Light(w)) => {
                for (i, state) in changes {
                    w[i].state = state;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_widget_updates(&self, updates: &[WidgetUpdate]) -> IndiResult<Pending> {
        let parse_bound = |b: &Option<String>| -> IndiResult<Option<f64>> {
            b.as_deref().map(number::parse_number).transpose()
        };

        Ok(match &self.widgets {
            Widgets::Number(w) => {
                let mut out = Vec::new();
                for u in updates {
                    if let Some(i) = w.iter().position(|x| x.name == u.name) {
                        let value = number::parse_number(&u.value)?;
                        out.push((i, value, parse_bound(&u.min)?, parse_bound(&u.max)?));
                    }
                }
                Pending::Number(out)
            }
            Widgets::Switch(w) => {
                let mut out = Vec::new();
                for u in updates {
                    if let Some(i) = w.iter().position(|x| x.name == u.name) {
                        out.push((i, SwitchState::parse(&u.value)?));
                    }
                }
                Pending::Switch(out)
            }
            Widgets::Text(w) => Pending::Text(
                updates
                    .iter()
                    .filter_map(|u| w.iter().position(|x| x.name == u.name).map(|i| (i, u.value.clone())))
                    .collect(),
            ),
            Widgets::Light(w) => {
                let mut out = Vec::new();
                for u in updates {
                    if let Some(i) = w.iter().position(|x| x.name == u.name) {
                        out.push((i, PropertyState::parse(&u.value)?));
                    }
                }
                Pending::Light(out)
            }
            Widgets::Blob(_) => Pending::None,
        })
    }

    fn state_error(&self, reason: String) -> IndiError {
        IndiError::State {
            device: self.device.clone(),
            property: self.name.clone(),
            reason,
        }
    }

    /// Install a hook run once per completed batch of widget changes
    pub fn set_update_hook(&mut self, hook: UpdateHook) {
        self.update_hook = Some(hook);
    }

    pub fn clear_update_hook(&mut self) {
        self.update_hook = None;
    }

    /// Signal that a batch of widget changes is complete
    pub fn emit_update(&self) {
        if let Some(hook) = &self.update_hook {
            hook(self);
        }
    }

    /// Replace shape and metadata with those of a fresh definition, keeping hooks
    pub(crate) fn fill_from(&mut self, defined: Property) {
        self.label = defined.label;
        self.group = defined.group;
        self.permission = defined.permission;
        self.state = defined.state;
        self.timeout = defined.timeout;
        self.rule = defined.rule;
        self.widgets = defined.widgets;
        self.dynamic |= defined.dynamic;
        self.registered = true;
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("device", &self.device)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("permission", &self.permission)
            .field("registered", &self.registered)
            .field("dynamic", &self.dynamic)
            .field("widgets", &self.widgets)
            .finish_non_exhaustive()
    }
}

// The update hook is not part of a property's value.
impl PartialEq for Property {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.device == other.device
            && self.label == other.label
            && self.group == other.group
            && self.permission == other.permission
            && self.state == other.state
            && self.timeout == other.timeout
            && self.registered == other.registered
            && self.dynamic == other.dynamic
            && self.rule == other.rule
            && self.widgets == other.widgets
    }
}

/// Shared handle to a property owned by a device
///
/// Name, kind and registration are cached outside the lock so registry
/// scans never wait on a property that is being updated.
#[derive(Clone)]
pub struct PropertyHandle {
    name: Arc<str>,
    kind: PropertyKind,
    registered: Arc<AtomicBool>,
    inner: Arc<RwLock<Property>>,
}

impl PropertyHandle {
    pub fn new(property: Property) -> Self {
        Self {
            name: Arc::from(property.name.as_str()),
            kind: property.kind(),
            registered: Arc::new(AtomicBool::new(property.registered)),
            inner: Arc::new(RwLock::new(property)),
        }
    }

    /// Name, readable without locking
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Shared access
    ///
    /// Recursive, so observer callbacks, which run under a read lock, can
    /// read the same property again while a writer is queued.
    pub fn read(&self) -> RwLockReadGuard<'_, Property> {
        self.inner.read_recursive()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Property> {
        self.inner.write()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Promote a ghost, optionally filling it from a fresh definition
    ///
    /// Runs under the property's write lock and succeeds for exactly one
    /// caller; returns false if the property was already registered.
    pub(crate) fn promote(&self, defined: Option<Property>) -> bool {
        let mut prop = self.inner.write();
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(defined) = defined {
            prop.fill_from(defined);
        }
        prop.registered = true;
        true
    }

    /// True if both handles refer to the same property
    pub fn same_as(&self, other: &PropertyHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for PropertyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn focuser_position() -> Property {
        let mut prop = Property::new("Focuser Simulator", "ABS_FOCUS_POSITION", PropertyKind::Number);
        prop.permission = Permission::ReadWrite;
        prop.set_widgets(Widgets::Number(vec![NumberWidget::new(
            "FOCUS_ABSOLUTE_POSITION",
            "Ticks",
            "%6.0f",
            0.0,
            100000.0,
            10.0,
            50000.0,
        )]))
        .unwrap();
        prop
    }

    fn slew_rate() -> Property {
        let mut prop = Property::new("Telescope Simulator", "TELESCOPE_SLEW_RATE", PropertyKind::Switch);
        prop.rule = SwitchRule::OneOfMany;
        prop.set_widgets(Widgets::Switch(vec![
            SwitchWidget::new("1x", "Guide", SwitchState::On),
            SwitchWidget::new("2x", "Centering", SwitchState::Off),
            SwitchWidget::new("3x", "Find", SwitchState::Off),
        ]))
        .unwrap();
        prop
    }

    #[test]
    fn test_find_widget() {
        let prop = focuser_position();
        let widget = prop.find_widget("FOCUS_ABSOLUTE_POSITION").unwrap();
        assert_eq!(widget.label(), "Ticks");
        assert!(matches!(widget, WidgetRef::Number(_)));
        assert!(prop.find_widget("focus_absolute_position").is_none());
        assert_eq!(prop.kind(), PropertyKind::Number);
    }

    #[test]
    fn test_apply_update_values_and_bounds() {
        let mut prop = focuser_position();
        let update = VectorUpdate {
            state: Some("Busy".to_string()),
            timeout: Some("60".to_string()),
            widgets: vec![WidgetUpdate {
                name: "FOCUS_ABSOLUTE_POSITION".to_string(),
                value: "120000".to_string(),
                min: None,
                max: Some("200000".to_string()),
            }],
        };
        prop.apply_update(&update).unwrap();
        assert_eq!(prop.state, PropertyState::Busy);
        assert_eq!(prop.timeout, 60.0);
        let w = &prop.numbers()[0];
        assert_eq!(w.value, 120000.0);
        assert_eq!(w.max, 200000.0);
        assert_eq!(w.min, 0.0);
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let mut once = slew_rate();
        let update = VectorUpdate {
            state: Some("Ok".to_string()),
            timeout: None,
            widgets: vec![WidgetUpdate::new("1x", "Off"), WidgetUpdate::new("3x", "On")],
        };
        once.apply_update(&update).unwrap();
        let mut twice = slew_rate();
        twice.apply_update(&update).unwrap();
        twice.apply_update(&update).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.on_switch().unwrap().name, "3x");
    }

    #[test]
    fn test_bogus_state_leaves_property_untouched() {
        let mut prop = focuser_position();
        let before = focuser_position();
        let update = VectorUpdate {
            state: Some("Sideways".to_string()),
            timeout: None,
            widgets: vec![WidgetUpdate::new("FOCUS_ABSOLUTE_POSITION", "10")],
        };
        let err = prop.apply_update(&update).unwrap_err();
        assert!(matches!(err, IndiError::State { .. }));
        assert_eq!(prop, before);

        let update = VectorUpdate {
            state: Some("Ok".to_string()),
            timeout: Some("soon".to_string()),
            widgets: vec![],
        };
        assert!(prop.apply_update(&update).is_err());
        assert_eq!(prop, before);
    }

    #[test]
    fn test_bad_widget_value_aborts_whole_update() {
        let mut prop = slew_rate();
        let update = VectorUpdate {
            state: Some("Alert".to_string()),
            timeout: None,
            widgets: vec![WidgetUpdate::new("1x", "Off"), WidgetUpdate::new("2x", "Yes")],
        };
        let err = prop.apply_update(&update).unwrap_err();
        assert!(matches!(err, IndiError::Parse { .. }));
        assert_eq!(prop, slew_rate());
    }

    #[test]
    fn test_unknown_widget_names_are_ignored() {
        let mut prop = focuser_position();
        let update = VectorUpdate {
            state: None,
            timeout: None,
            widgets: vec![
                WidgetUpdate::new("FOCUS_RELATIVE_POSITION", "garbage"),
                WidgetUpdate::new("FOCUS_ABSOLUTE_POSITION", "42"),
            ],
        };
        prop.apply_update(&update).unwrap();
        assert_eq!(prop.widgets().len(), 1);
        assert_eq!(prop.number_value("FOCUS_ABSOLUTE_POSITION"), Some(42.0));
    }

    #[test]
    fn test_set_switch_honours_rule() {
        let mut prop = slew_rate();
        assert!(prop.set_switch("2x", SwitchState::On));
        assert_eq!(prop.switch_state("1x"), Some(SwitchState::Off));
        assert_eq!(prop.switch_state("2x"), Some(SwitchState::On));
        assert!(!prop.set_switch("9x", SwitchState::On));

        prop.rule = SwitchRule::AnyOfMany;
        prop.set_switch("3x", SwitchState::On);
        assert_eq!(prop.switch_state("2x"), Some(SwitchState::On));
        assert_eq!(prop.switch_state("3x"), Some(SwitchState::On));
    }

    #[test]
    fn test_emit_update_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut prop = focuser_position();
        let counter = calls.clone();
        prop.set_update_hook(Arc::new(move |p: &Property| {
            assert_eq!(p.name, "ABS_FOCUS_POSITION");
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        prop.emit_update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        prop.clear_update_hook();
        prop.emit_update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_outlives_owner_list() {
        let handle = PropertyHandle::new(focuser_position());
        let list = vec![handle.clone()];
        drop(list);
        assert_eq!(handle.name(), "ABS_FOCUS_POSITION");
        handle.write().state = PropertyState::Ok;
        assert_eq!(handle.read().state, PropertyState::Ok);
        assert!(handle.is_registered());
        assert!(handle.same_as(&handle.clone()));

        let ghost = PropertyHandle::new(Property::ghost("Focuser Simulator", "FOCUS_MAX", PropertyKind::Number));
        assert!(!ghost.is_registered());
        assert!(ghost.promote(None));
        assert!(!ghost.promote(None));
        assert!(ghost.is_registered());
        assert!(ghost.read().is_registered());
    }

    #[test]
    fn test_ghost_fill_keeps_identity() {
        let mut ghost = Property::ghost("Focuser Simulator", "ABS_FOCUS_POSITION", PropertyKind::Number);
        assert!(!ghost.is_registered());
        ghost.fill_from(focuser_position());
        assert!(ghost.is_registered());
        assert_eq!(ghost.permission, Permission::ReadWrite);
        assert_eq!(ghost.widgets().names(), vec!["FOCUS_ABSOLUTE_POSITION"]);
    }

    #[test]
    fn test_set_widgets_keeps_kind_and_unique_names() {
        let mut prop = Property::new("CCD Simulator", "CCD_TEMPERATURE", PropertyKind::Number);
        prop.set_widgets(Widgets::Number(vec![
            NumberWidget::new("CCD_TEMPERATURE_VALUE", "Temp", "%5.2f", -50.0, 50.0, 0.0, 20.0),
            NumberWidget::new("CCD_TEMPERATURE_VALUE", "Again", "%5.2f", -50.0, 50.0, 0.0, -10.0),
        ]))
        .unwrap();
        assert_eq!(prop.widgets().names(), vec!["CCD_TEMPERATURE_VALUE"]);
        assert_eq!(prop.number_value("CCD_TEMPERATURE_VALUE"), Some(20.0));

        let err = prop
            .set_widgets(Widgets::Text(vec![TextWidget::new("T", "T", "x")]))
            .unwrap_err();
        assert!(matches!(err, IndiError::KindMismatch { .. }));
        assert_eq!(prop.kind(), PropertyKind::Number);
    }

    #[test]
    fn test_read_is_reentrant_while_writer_waits() {
        let handle = PropertyHandle::new(focuser_position());
        let outer = handle.read();

        let writer_handle = handle.clone();
        let writer = std::thread::spawn(move || {
            writer_handle.write().state = PropertyState::Busy;
        });
        std::thread::sleep(std::time::Duration::from_millis(50));

        // a plain fair read would queue behind the writer and never return
        assert_eq!(handle.read().state, PropertyState::Idle);
        drop(outer);
        writer.join().unwrap();
        assert_eq!(handle.read().state, PropertyState::Busy);
    }
}
