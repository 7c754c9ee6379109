use limine::{
    BaseRevision, ExecutableAddressRequest, HhdmRequest, MemMapRequest, RequestsEndMarker,
    RequestsStartMarker, RsdpRequest, mp::MpRequest,
};

#[repr(C, align(8))]
pub struct LimineRequests {
    _start_marker: RequestsStartMarker,
    pub base_revision: BaseRevision,
    pub memmap: MemMapRequest,
    pub hhdm: HhdmRequest,
    pub executable_address: ExecutableAddressRequest,
    pub mp: MpRequest,
    pub rsdp: RsdpRequest,
    _end_marker: RequestsEndMarker,
}

impl LimineRequests {
    const fn new() -> Self {
        Self {
            _start_marker: RequestsStartMarker::new(),
            base_revision: BaseRevision::new(),
            memmap: MemMapRequest::new(),
            hhdm: HhdmRequest::new(),
            executable_address: ExecutableAddressRequest::new(),
            mp: MpRequest::new(),
            rsdp: RsdpRequest::new(),
            _end_marker: RequestsEndMarker::new(),
        }
    }
}

// SAFETY: read only by the bootloader, never mutated after initialization.
unsafe impl Sync for LimineRequests {}

#[used]
#[unsafe(link_section = ".requests")]
pub static REQUESTS: LimineRequests = LimineRequests::new();
