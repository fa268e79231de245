//! Application inspection dispatch table
//!
//! Maps (transport class, application protocol, direction) to the ordered
//! list of inspection engines run on matching records. The table is built
//! once before workers start and then only read, without locking.

use crate::error::{DetectError, Result};
use crate::inspect::{BufferInspector, InspectContext, InspectResult};
use sase_ips::{AppProto, SigList, TransportClass};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Flow direction of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    pub const COUNT: usize = 2;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Result<Self> {
        match idx {
            0 => Ok(Self::ToServer),
            1 => Ok(Self::ToClient),
            _ => Err(DetectError::Registration(format!("invalid direction index {}", idx))),
        }
    }
}

/// Inspection flag set on a flow once an engine has run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InspectFlags(u32);

impl InspectFlags {
    pub const URI_INSPECT: Self = Self(1 << 0);
    pub const HCBD: Self = Self(1 << 1);
    pub const HSBD: Self = Self(1 << 2);
    pub const HHD: Self = Self(1 << 3);
    pub const HRHD: Self = Self(1 << 4);
    pub const HMD: Self = Self(1 << 5);
    pub const HCD: Self = Self(1 << 6);
    pub const HRUD: Self = Self(1 << 7);
    pub const FILE_TS: Self = Self(1 << 8);
    pub const FILE_TC: Self = Self(1 << 9);
    pub const HSMD: Self = Self(1 << 10);
    pub const HSCD: Self = Self(1 << 11);
    pub const HUAD: Self = Self(1 << 12);
    pub const HHHD: Self = Self(1 << 13);
    pub const HRHHD: Self = Self(1 << 14);
    pub const HRL: Self = Self(1 << 15);
    pub const DNSQUERY: Self = Self(1 << 16);
    pub const FD_SMTP: Self = Self(1 << 17);
    pub const MODBUS: Self = Self(1 << 18);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Inspection callback
pub trait AppInspector: Send + Sync {
    fn name(&self) -> &str;

    fn inspect(&self, ctx: &mut InspectContext<'_>) -> InspectResult;
}

/// One registered engine
#[derive(Clone)]
pub struct InspectEngine {
    pub list: SigList,
    pub flags: InspectFlags,
    pub inspector: Arc<dyn AppInspector>,
}

impl InspectEngine {
    fn same_inspector(&self, other: &Arc<dyn AppInspector>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inspector) as *const (),
            Arc::as_ptr(other) as *const (),
        )
    }
}

impl fmt::Debug for InspectEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectEngine")
            .field("list", &self.list)
            .field("flags", &self.flags)
            .field("inspector", &self.inspector.name())
            .finish()
    }
}

const SLOTS: usize = TransportClass::COUNT * AppProto::COUNT * Direction::COUNT;

#[inline]
fn slot(transport: TransportClass, app: AppProto, direction: Direction) -> usize {
    (transport.index() * AppProto::COUNT + app.index()) * Direction::COUNT + direction.index()
}

/// Mutable table used during startup
pub struct DispatchTableBuilder {
    slots: Vec<Vec<InspectEngine>>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self {
            slots: vec![Vec::new(); SLOTS],
        }
    }

    /// Register an engine; panics on an invalid or conflicting registration
    pub fn register(
        &mut self,
        transport: TransportClass,
        app: AppProto,
        direction: Direction,
        list: SigList,
        flags: InspectFlags,
        inspector: Arc<dyn AppInspector>,
    ) -> &mut Self {
        if let Err(e) = self.try_register(transport, app, direction, list, flags, inspector) {
            panic!("{}", e);
        }
        self
    }

    /// Register an engine, reporting invalid or conflicting registrations.
    /// Registering the same list with the same inspector again is a no-op.
    pub fn try_register(
        &mut self,
        transport: TransportClass,
        app: AppProto,
        direction: Direction,
        list: SigList,
        flags: InspectFlags,
        inspector: Arc<dyn AppInspector>,
    ) -> Result<()> {
        if !app.is_real() {
            return Err(DetectError::Registration(format!(
                "invalid application protocol {}",
                app
            )));
        }
        if !list.is_selector() {
            return Err(DetectError::Registration(format!("invalid rule list {}", list)));
        }

        let entries = &mut self.slots[slot(transport, app, direction)];
        if entries
            .iter()
            .any(|existing| existing.list == list && existing.same_inspector(&inspector))
        {
            return Ok(());
        }
        for existing in entries.iter() {
            if existing.list == list || existing.flags == flags {
                return Err(DetectError::Registration(format!(
                    "duplicate inspection engine for {:?}/{}/{:?}: list {} flags {:#x} collide with {} ({:#x})",
                    transport,
                    app,
                    direction,
                    list,
                    flags.bits(),
                    existing.list,
                    existing.flags.bits()
                )));
            }
        }

        tracing::debug!(
            ?transport,
            app = %app,
            ?direction,
            list = %list,
            inspector = inspector.name(),
            "Registered inspection engine"
        );
        entries.push(InspectEngine {
            list,
            flags,
            inspector,
        });
        Ok(())
    }

    /// The engine's standard application inspectors
    pub fn with_default_engines() -> Self {
        use AppProto::{Dns, Http, Modbus, Smtp};
        use Direction::{ToClient, ToServer};
        use TransportClass::{Tcp, Udp};

        let mut inspectors: HashMap<SigList, Arc<dyn AppInspector>> = HashMap::new();
        let mut inspector = |list: SigList| -> Arc<dyn AppInspector> {
            inspectors
                .entry(list)
                .or_insert_with(|| Arc::new(BufferInspector::new(list)))
                .clone()
        };

        let table: [(TransportClass, AppProto, Direction, SigList, InspectFlags); 27] = [
            (Tcp, Http, ToServer, SigList::Uri, InspectFlags::URI_INSPECT),
            (Tcp, Http, ToServer, SigList::RequestLine, InspectFlags::HRL),
            (Tcp, Http, ToServer, SigList::ClientBody, InspectFlags::HCBD),
            (Tcp, Http, ToServer, SigList::Headers, InspectFlags::HHD),
            (Tcp, Http, ToServer, SigList::RawHeaders, InspectFlags::HRHD),
            (Tcp, Http, ToServer, SigList::Method, InspectFlags::HMD),
            (Tcp, Http, ToServer, SigList::Cookie, InspectFlags::HCD),
            (Tcp, Http, ToServer, SigList::RawUri, InspectFlags::HRUD),
            (Tcp, Http, ToServer, SigList::File, InspectFlags::FILE_TS),
            (Tcp, Http, ToServer, SigList::UserAgent, InspectFlags::HUAD),
            (Tcp, Http, ToServer, SigList::Host, InspectFlags::HHHD),
            (Tcp, Http, ToServer, SigList::RawHost, InspectFlags::HRHHD),
            (Tcp, Dns, ToServer, SigList::DnsQuery, InspectFlags::DNSQUERY),
            (Udp, Dns, ToServer, SigList::DnsQuery, InspectFlags::DNSQUERY),
            (Tcp, Smtp, ToServer, SigList::File, InspectFlags::FILE_TS),
            (Tcp, Modbus, ToServer, SigList::Modbus, InspectFlags::MODBUS),
            (Tcp, Smtp, ToServer, SigList::FileData, InspectFlags::FD_SMTP),
            (Tcp, Http, ToClient, SigList::FileData, InspectFlags::HSBD),
            (Tcp, Http, ToClient, SigList::Headers, InspectFlags::HHD),
            (Tcp, Http, ToClient, SigList::RawHeaders, InspectFlags::HRHD),
            (Tcp, Http, ToClient, SigList::Cookie, InspectFlags::HCD),
            (Tcp, Http, ToClient, SigList::File, InspectFlags::FILE_TC),
            (Tcp, Http, ToClient, SigList::StatMsg, InspectFlags::HSMD),
            (Tcp, Http, ToClient, SigList::StatCode, InspectFlags::HSCD),
            (Tcp, Modbus, ToClient, SigList::Modbus, InspectFlags::MODBUS),
            // Duplicates of the above are no-ops
            (Tcp, Http, ToServer, SigList::Uri, InspectFlags::URI_INSPECT),
            (Udp, Dns, ToServer, SigList::DnsQuery, InspectFlags::DNSQUERY),
        ];

        let mut builder = Self::new();
        for (transport, app, direction, list, flags) in table {
            builder.register(transport, app, direction, list, flags, inspector(list));
        }
        builder
    }

    /// Freeze the table
    pub fn build(self) -> DispatchTable {
        let engines: usize = self.slots.iter().map(Vec::len).sum();
        tracing::info!(engines, "Inspection dispatch table built");
        DispatchTable { slots: self.slots }
    }
}

impl Default for DispatchTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable dispatch table, shared read-only by all workers
pub struct DispatchTable {
    slots: Vec<Vec<InspectEngine>>,
}

impl DispatchTable {
    #[inline]
    pub fn lookup(
        &self,
        transport: TransportClass,
        app: AppProto,
        direction: Direction,
    ) -> &[InspectEngine] {
        &self.slots[slot(transport, app, direction)]
    }

    /// Total number of registered engines
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable").field("engines", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl AppInspector for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn inspect(&self, _ctx: &mut InspectContext<'_>) -> InspectResult {
            InspectResult::NoMatch
        }
    }

    fn named(name: &'static str) -> Arc<dyn AppInspector> {
        Arc::new(Named(name))
    }

    #[test]
    fn test_register_and_lookup() {
        let f = named("F");
        let mut builder = DispatchTableBuilder::new();
        builder.register(
            TransportClass::Tcp,
            AppProto::Http,
            Direction::ToServer,
            SigList::Uri,
            InspectFlags::URI_INSPECT,
            f.clone(),
        );
        let table = builder.build();

        let to_server = table.lookup(TransportClass::Tcp, AppProto::Http, Direction::ToServer);
        assert_eq!(to_server.len(), 1);
        assert!(to_server[0].same_inspector(&f));
        assert!(table
            .lookup(TransportClass::Tcp, AppProto::Http, Direction::ToClient)
            .is_empty());
        assert!(table
            .lookup(TransportClass::Udp, AppProto::Http, Direction::ToServer)
            .is_empty());
    }

    #[test]
    fn test_identical_registration_is_noop() {
        let f = named("F");
        let mut builder = DispatchTableBuilder::new();
        for _ in 0..2 {
            builder
                .try_register(
                    TransportClass::Tcp,
                    AppProto::Http,
                    Direction::ToServer,
                    SigList::Uri,
                    InspectFlags::URI_INSPECT,
                    f.clone(),
                )
                .unwrap();
        }
        assert_eq!(builder.build().len(), 1);
    }

    #[test]
    fn test_colliding_registrations_rejected() {
        let mut builder = DispatchTableBuilder::new();
        builder.register(
            TransportClass::Tcp,
            AppProto::Http,
            Direction::ToServer,
            SigList::Uri,
            InspectFlags::URI_INSPECT,
            named("F"),
        );

        // Same list, different callback
        assert!(builder
            .try_register(
                TransportClass::Tcp,
                AppProto::Http,
                Direction::ToServer,
                SigList::Uri,
                InspectFlags::HRUD,
                named("G"),
            )
            .is_err());
        // Same flag, different list
        assert!(builder
            .try_register(
                TransportClass::Tcp,
                AppProto::Http,
                Direction::ToServer,
                SigList::RawUri,
                InspectFlags::URI_INSPECT,
                named("G"),
            )
            .is_err());
        // Other direction does not collide
        assert!(builder
            .try_register(
                TransportClass::Tcp,
                AppProto::Http,
                Direction::ToClient,
                SigList::Uri,
                InspectFlags::URI_INSPECT,
                named("G"),
            )
            .is_ok());
    }

    #[test]
    fn test_identical_registration_found_behind_collision() {
        let f = named("F");
        let mut builder = DispatchTableBuilder::new();
        builder.register(
            TransportClass::Tcp,
            AppProto::Http,
            Direction::ToServer,
            SigList::Uri,
            InspectFlags::HRUD,
            named("G"),
        );
        builder.register(
            TransportClass::Tcp,
            AppProto::Http,
            Direction::ToServer,
            SigList::RawUri,
            InspectFlags::URI_INSPECT,
            f.clone(),
        );

        // Flag collides with the first entry, but the second is the same engine
        builder
            .try_register(
                TransportClass::Tcp,
                AppProto::Http,
                Direction::ToServer,
                SigList::RawUri,
                InspectFlags::HRUD,
                f,
            )
            .unwrap();
        assert_eq!(builder.build().len(), 2);
    }

    #[test]
    #[should_panic(expected = "duplicate inspection engine")]
    fn test_register_panics_on_duplicate() {
        let mut builder = DispatchTableBuilder::new();
        for name in ["F", "G"] {
            builder.register(
                TransportClass::Tcp,
                AppProto::Dns,
                Direction::ToServer,
                SigList::DnsQuery,
                InspectFlags::DNSQUERY,
                named(name),
            );
        }
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let mut builder = DispatchTableBuilder::new();
        for app in [AppProto::Unknown, AppProto::Failed] {
            assert!(builder
                .try_register(
                    TransportClass::Tcp,
                    app,
                    Direction::ToServer,
                    SigList::Uri,
                    InspectFlags::URI_INSPECT,
                    named("F"),
                )
                .is_err());
        }
        assert!(builder
            .try_register(
                TransportClass::Tcp,
                AppProto::Http,
                Direction::ToServer,
                SigList::NotSet,
                InspectFlags::URI_INSPECT,
                named("F"),
            )
            .is_err());
        assert!(Direction::from_index(2).is_err());
        assert_eq!(Direction::from_index(1).unwrap(), Direction::ToClient);
    }

    #[test]
    fn test_default_engines() {
        let table = DispatchTableBuilder::with_default_engines().build();

        assert_eq!(table.len(), 25);
        assert_eq!(
            table.lookup(TransportClass::Tcp, AppProto::Http, Direction::ToServer).len(),
            12
        );
        assert_eq!(
            table.lookup(TransportClass::Tcp, AppProto::Http, Direction::ToClient).len(),
            7
        );
        assert_eq!(
            table.lookup(TransportClass::Udp, AppProto::Dns, Direction::ToServer)[0].list,
            SigList::DnsQuery
        );
        assert_eq!(
            table.lookup(TransportClass::Tcp, AppProto::Smtp, Direction::ToServer).len(),
            2
        );
    }
}
