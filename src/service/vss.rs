//! Volume Shadow Copy backend over the COM `IVssBackupComponents` API.

use std::mem;
use std::ptr;

use uuid::Uuid;
use winapi::Interface;
use winapi::shared::guiddef::GUID;
use winapi::shared::minwindef::TRUE;
use winapi::shared::winerror::{FAILED, RPC_E_CHANGED_MODE, S_FALSE, S_OK};
use winapi::shared::wtypes::BSTR;
use winapi::um::combaseapi::{CoInitializeEx, CoTaskMemFree, CoUninitialize};
use winapi::um::objbase::COINIT_MULTITHREADED;
use winapi::um::oleauto::SysFreeString;
use winapi::um::unknwnbase::IUnknown;
use winapi::um::vsbackup::{
    CreateVssBackupComponentsInternal, IVssBackupComponents, IVssExamineWriterMetadata, IVssWMComponent,
    PVSSCOMPONENTINFO, VssFreeSnapshotPropertiesInternal,
};
use winapi::um::vss::{
    IVssAsync, IVssEnumObject, VSS_BT_FULL, VSS_OBJECT_NONE, VSS_OBJECT_PROP, VSS_OBJECT_PROVIDER,
    VSS_OBJECT_SNAPSHOT_SET, VSS_PROV_SYSTEM, VSS_SNAPSHOT_PROP,
};
use winapi::um::vswriter::{
    IVssWMFiledesc, VSS_COMPONENT_TYPE, VSS_CT_DATABASE, VSS_CT_FILEGROUP, VSS_CT_UNDEFINED, VSS_SOURCE_TYPE,
    VSS_USAGE_TYPE,
};
use winapi::um::winbase::INFINITE;

use super::{AsyncOperation, AsyncStatus, BackupState, BackupType, ComponentInfo, CoordinationService};
use super::{FileDescriptor, WriterMetadata};
use crate::error::{Result, ShadowError};
use crate::writer::{Component, ComponentType, Writer};

const VSS_E_BAD_STATE: i32 = 0x8004_2301_u32 as i32;

fn check(call: &'static str, hr: i32) -> Result<()> {
    if FAILED(hr) { Err(ShadowError::platform(call, hr)) } else { Ok(()) }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

fn from_wide(p: *const u16) -> String {
    if p.is_null() {
        return String::new();
    }
    let mut len = 0;
    unsafe {
        while *p.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(p, len))
    }
}

/// Copies a BSTR out and frees it.
fn take_bstr(b: BSTR) -> String {
    let s = from_wide(b);
    if !b.is_null() {
        unsafe { SysFreeString(b) };
    }
    s
}

fn to_uuid(g: &GUID) -> Uuid {
    Uuid::from_fields(g.Data1, g.Data2, g.Data3, &g.Data4)
}

fn to_guid(u: Uuid) -> GUID {
    let (d1, d2, d3, d4) = u.as_fields();
    GUID { Data1: d1, Data2: d2, Data3: d3, Data4: *d4 }
}

fn component_type(ct: VSS_COMPONENT_TYPE) -> ComponentType {
    match ct {
        VSS_CT_DATABASE => ComponentType::Database,
        VSS_CT_FILEGROUP => ComponentType::FileGroup,
        _ => ComponentType::Undefined,
    }
}

fn native_component_type(ct: ComponentType) -> VSS_COMPONENT_TYPE {
    match ct {
        ComponentType::Database => VSS_CT_DATABASE,
        ComponentType::FileGroup => VSS_CT_FILEGROUP,
        ComponentType::Undefined => VSS_CT_UNDEFINED,
    }
}

/// Owned COM interface pointer, released on drop.
struct ComPtr<T: Interface>(*mut T);

impl<T: Interface> ComPtr<T> {
    fn get(&self) -> &T {
        unsafe { &*self.0 }
    }
}

impl<T: Interface> Drop for ComPtr<T> {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { (*(self.0 as *mut IUnknown)).Release() };
        }
    }
}

/// Keeps COM initialized on this thread while the service lives.
struct Apartment {
    owned: bool,
}

impl Apartment {
    fn enter() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(ptr::null_mut(), COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            // Someone else already owns the apartment; use it as is.
            return Ok(Apartment { owned: false });
        }
        check("CoInitializeEx", hr)?;
        Ok(Apartment { owned: true })
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CoUninitialize() };
        }
    }
}

fn create_backup_components() -> Result<ComPtr<IVssBackupComponents>> {
    let mut raw = ptr::null_mut();
    check("CreateVssBackupComponents", unsafe { CreateVssBackupComponentsInternal(&mut raw) })?;
    Ok(ComPtr(raw))
}

fn initialize(components: &ComPtr<IVssBackupComponents>) -> Result<()> {
    check("InitializeForBackup", unsafe { components.get().InitializeForBackup(ptr::null_mut()) })
}

struct VssAsync(ComPtr<IVssAsync>);

impl AsyncOperation for VssAsync {
    fn wait(&mut self) -> Result<()> {
        check("IVssAsync::Wait", unsafe { self.0.get().Wait(INFINITE) })
    }

    fn query_status(&mut self) -> Result<AsyncStatus> {
        let mut hr = 0;
        check("IVssAsync::QueryStatus", unsafe { self.0.get().QueryStatus(&mut hr, ptr::null_mut()) })?;
        Ok(AsyncStatus::from_hresult(hr))
    }

    fn cancel(&mut self) -> Result<()> {
        check("IVssAsync::Cancel", unsafe { self.0.get().Cancel() })
    }
}

fn file_descriptors(
    count: u32,
    call: &'static str,
    fetch: impl Fn(u32, *mut *mut IVssWMFiledesc) -> i32,
) -> Result<Vec<FileDescriptor>> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let mut raw = ptr::null_mut();
        check(call, fetch(i, &mut raw))?;
        let desc = ComPtr(raw);
        let mut path: BSTR = ptr::null_mut();
        let mut spec: BSTR = ptr::null_mut();
        check("IVssWMFiledesc::GetPath", unsafe { desc.get().GetPath(&mut path) })?;
        let path = take_bstr(path);
        check("IVssWMFiledesc::GetFilespec", unsafe { desc.get().GetFilespec(&mut spec) })?;
        out.push(FileDescriptor { path, filespec: take_bstr(spec) });
    }
    Ok(out)
}

fn read_component(component: &ComPtr<IVssWMComponent>) -> Result<ComponentInfo> {
    let wm = component.get();
    let mut info: PVSSCOMPONENTINFO = ptr::null_mut();
    check("IVssWMComponent::GetComponentInfo", unsafe { wm.GetComponentInfo(&mut info) })?;

    let (name, logical_path, ct, selectable, counts) = unsafe {
        let i = &*info;
        (
            from_wide(i.bstrComponentName),
            from_wide(i.bstrLogicalPath),
            i.type_,
            i.bSelectable,
            (i.cFileCount, i.cDatabases, i.cLogFiles),
        )
    };
    let descriptors = (|| {
        Ok::<_, ShadowError>((
            file_descriptors(counts.0, "IVssWMComponent::GetFile", |n, p| unsafe { wm.GetFile(n, p) })?,
            file_descriptors(counts.1, "IVssWMComponent::GetDatabaseFile", |n, p| unsafe {
                wm.GetDatabaseFile(n, p)
            })?,
            file_descriptors(counts.2, "IVssWMComponent::GetDatabaseLogFile", |n, p| unsafe {
                wm.GetDatabaseLogFile(n, p)
            })?,
        ))
    })();
    check("IVssWMComponent::FreeComponentInfo", unsafe { wm.FreeComponentInfo(info) })?;
    let (files, databases, log_files) = descriptors?;

    Ok(ComponentInfo {
        name,
        logical_path,
        component_type: component_type(ct),
        selectable,
        files,
        databases,
        log_files,
    })
}

/// One backup session against the local VSS service.
pub struct VssBackupService {
    components: Option<ComPtr<IVssBackupComponents>>,
    _apartment: Apartment,
}

impl VssBackupService {
    pub fn new() -> Result<Self> {
        Ok(Self { components: None, _apartment: Apartment::enter()? })
    }

    fn components(&self, call: &'static str) -> Result<&IVssBackupComponents> {
        self.components
            .as_ref()
            .map(ComPtr::get)
            .ok_or(ShadowError::platform(call, VSS_E_BAD_STATE))
    }

    fn start(
        &self,
        call: &'static str,
        f: impl FnOnce(&IVssBackupComponents, *mut *mut IVssAsync) -> i32,
    ) -> Result<Box<dyn AsyncOperation>> {
        let components = self.components(call)?;
        let mut raw = ptr::null_mut();
        check(call, f(components, &mut raw))?;
        Ok(Box::new(VssAsync(ComPtr(raw))))
    }
}

impl CoordinationService for VssBackupService {
    fn system_provider_id(&mut self) -> Result<Option<Uuid>> {
        // Providers are enumerated on a throwaway instance.
        let components = create_backup_components()?;
        initialize(&components)?;

        let mut raw = ptr::null_mut();
        let null_id: GUID = unsafe { mem::zeroed() };
        check("IVssBackupComponents::Query", unsafe {
            components.get().Query(null_id, VSS_OBJECT_NONE, VSS_OBJECT_PROVIDER, &mut raw)
        })?;
        let providers = ComPtr::<IVssEnumObject>(raw);

        loop {
            let mut prop: VSS_OBJECT_PROP = unsafe { mem::zeroed() };
            let mut fetched = 0;
            let hr = unsafe { providers.get().Next(1, &mut prop, &mut fetched) };
            if hr == S_FALSE || (hr == S_OK && fetched == 0) {
                return Ok(None);
            }
            check("IVssEnumObject::Next", hr)?;
            let (id, is_system) = unsafe {
                let provider = prop.Obj.Prov();
                CoTaskMemFree(provider.m_pwszProviderName as *mut _);
                CoTaskMemFree(provider.m_pwszProviderVersion as *mut _);
                (to_uuid(&provider.m_ProviderId), provider.m_eProviderType == VSS_PROV_SYSTEM)
            };
            if is_system {
                return Ok(Some(id));
            }
        }
    }

    fn initialize_for_backup(&mut self) -> Result<()> {
        let components = create_backup_components()?;
        initialize(&components)?;
        self.components = Some(components);
        Ok(())
    }

    fn gather_writer_metadata(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.start("GatherWriterMetadata", |c, p| unsafe { c.GatherWriterMetadata(p) })
    }

    fn writer_count(&mut self) -> Result<usize> {
        let mut count = 0;
        let components = self.components("GetWriterMetadataCount")?;
        check("GetWriterMetadataCount", unsafe { components.GetWriterMetadataCount(&mut count) })?;
        Ok(count as usize)
    }

    fn writer_metadata(&mut self, index: usize) -> Result<WriterMetadata> {
        let components = self.components("GetWriterMetadata")?;
        let mut id: GUID = unsafe { mem::zeroed() };
        let mut raw: *mut IVssExamineWriterMetadata = ptr::null_mut();
        check("GetWriterMetadata", unsafe { components.GetWriterMetadata(index as u32, &mut id, &mut raw) })?;
        let examine = ComPtr(raw);

        let mut instance_id: GUID = unsafe { mem::zeroed() };
        let mut writer_id: GUID = unsafe { mem::zeroed() };
        let mut name: BSTR = ptr::null_mut();
        let mut usage: VSS_USAGE_TYPE = 0;
        let mut source: VSS_SOURCE_TYPE = 0;
        check("IVssExamineWriterMetadata::GetIdentity", unsafe {
            examine.get().GetIdentity(&mut instance_id, &mut writer_id, &mut name, &mut usage, &mut source)
        })?;
        let name = take_bstr(name);

        let (mut include, mut exclude, mut count) = (0, 0, 0);
        check("IVssExamineWriterMetadata::GetFileCounts", unsafe {
            examine.get().GetFileCounts(&mut include, &mut exclude, &mut count)
        })?;

        let mut infos = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut raw: *mut IVssWMComponent = ptr::null_mut();
            check("IVssExamineWriterMetadata::GetComponent", unsafe { examine.get().GetComponent(i, &mut raw) })?;
            infos.push(read_component(&ComPtr(raw))?);
        }

        Ok(WriterMetadata {
            instance_id: to_uuid(&instance_id),
            writer_id: to_uuid(&writer_id),
            name,
            components: infos,
        })
    }

    fn start_snapshot_set(&mut self) -> Result<Uuid> {
        let components = self.components("StartSnapshotSet")?;
        let mut id: GUID = unsafe { mem::zeroed() };
        check("StartSnapshotSet", unsafe { components.StartSnapshotSet(&mut id) })?;
        Ok(to_uuid(&id))
    }

    fn add_to_snapshot_set(&mut self, volume: &str, provider_id: Uuid) -> Result<Uuid> {
        let components = self.components("AddToSnapshotSet")?;
        let mut volume = wide(volume);
        let mut id: GUID = unsafe { mem::zeroed() };
        check("AddToSnapshotSet", unsafe {
            components.AddToSnapshotSet(volume.as_mut_ptr(), to_guid(provider_id), &mut id)
        })?;
        Ok(to_uuid(&id))
    }

    fn add_component(&mut self, writer: &Writer, component: &Component) -> Result<()> {
        let components = self.components("AddComponent")?;
        let logical_path = wide(&component.logical_path);
        let name = wide(&component.name);
        let path_ptr = if component.logical_path.is_empty() { ptr::null() } else { logical_path.as_ptr() };
        check("AddComponent", unsafe {
            components.AddComponent(
                to_guid(writer.instance_id),
                to_guid(writer.writer_id),
                native_component_type(component.component_type),
                path_ptr,
                name.as_ptr(),
            )
        })
    }

    fn set_backup_state(&mut self, state: BackupState) -> Result<()> {
        let components = self.components("SetBackupState")?;
        let backup_type = match state.backup_type {
            BackupType::Full => VSS_BT_FULL,
        };
        check("SetBackupState", unsafe {
            components.SetBackupState(
                state.select_components,
                state.bootable_system_state,
                backup_type,
                state.partial_file_support,
            )
        })
    }

    fn prepare_for_backup(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.start("PrepareForBackup", |c, p| unsafe { c.PrepareForBackup(p) })
    }

    fn do_snapshot_set(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.start("DoSnapshotSet", |c, p| unsafe { c.DoSnapshotSet(p) })
    }

    fn snapshot_device_object(&mut self, snapshot_id: Uuid) -> Result<String> {
        let components = self.components("GetSnapshotProperties")?;
        let mut prop: VSS_SNAPSHOT_PROP = unsafe { mem::zeroed() };
        check("GetSnapshotProperties", unsafe {
            components.GetSnapshotProperties(to_guid(snapshot_id), &mut prop)
        })?;
        let device = from_wide(prop.m_pwszSnapshotDeviceObject);
        unsafe { VssFreeSnapshotPropertiesInternal(&mut prop) };
        Ok(device)
    }

    fn backup_complete(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.start("BackupComplete", |c, p| unsafe { c.BackupComplete(p) })
    }

    fn abort_backup(&mut self) -> Result<()> {
        match self.components.as_ref() {
            Some(c) => check("AbortBackup", unsafe { c.get().AbortBackup() }),
            None => Ok(()),
        }
    }

    fn delete_snapshot_set(&mut self, snapshot_set_id: Uuid) -> Result<()> {
        let components = self.components("DeleteSnapshots")?;
        let mut deleted = 0;
        let mut not_deleted: GUID = unsafe { mem::zeroed() };
        check("DeleteSnapshots", unsafe {
            components.DeleteSnapshots(
                to_guid(snapshot_set_id),
                VSS_OBJECT_SNAPSHOT_SET,
                TRUE,
                &mut deleted,
                &mut not_deleted,
            )
        })
    }
}
