//! By-id accessors: one async method per command, returning decoded replies.

use crate::{
    codec::{DwpReader, DwpWriter},
    commands::{
        appdomain, array_ref, assembly, command_set, field, method, module, object_ref,
        stack_frame, string_ref, thread, type_, vm,
    },
    connection::Connection,
    error::{DwpError, Result},
    types::{
        ArrayBounds, AssemblyId, DomainId, Feature, FieldDetails, FieldId, FieldInfo, FrameId,
        FrameInfo, LineEntry, LocalInfo, MethodDebugInfo, MethodId, MethodInfo, ModuleId,
        ModuleInfo, ObjectId, ObjectInfo, ParamInfo, ThreadId, ThreadInfo, TypeId, TypeInfo,
        Value, VersionInfo, VmVersion,
    },
};

fn id_payload(id: u32) -> Vec<u8> {
    let mut w = DwpWriter::new();
    w.write_id(id);
    w.into_vec()
}

fn read_index(r: &mut DwpReader<'_>) -> Result<Option<usize>> {
    let index = r.read_i32()?;
    Ok(usize::try_from(index).ok())
}

impl Connection {
    async fn query_id(&self, command_set: u8, command: u8, id: u32) -> Result<Vec<u8>> {
        self.request(command_set, command, id_payload(id)).await
    }

    async fn query_unit(&self, command_set: u8, command: u8, payload: Vec<u8>) -> Result<()> {
        self.request(command_set, command, payload).await?;
        Ok(())
    }

    // --- VM ---------------------------------------------------------------

    pub async fn vm_version(&self) -> Result<VmVersion> {
        let payload = self.request(command_set::VM, vm::VERSION, Vec::new()).await?;
        let mut r = DwpReader::new(&payload);
        let description = r.read_string()?;
        let major = r.read_i32()?;
        let minor = r.read_i32()?;
        Ok(VmVersion {
            description,
            version: VersionInfo::new(major.max(0) as u32, minor.max(0) as u32),
        })
    }

    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self
            .request(command_set::VM, vm::ALL_THREADS, Vec::new())
            .await?;
        DwpReader::new(&payload).read_ids()
    }

    pub async fn vm_suspend(&self) -> Result<()> {
        self.query_unit(command_set::VM, vm::SUSPEND, Vec::new())
            .await
    }

    pub async fn vm_resume(&self) -> Result<()> {
        self.query_unit(command_set::VM, vm::RESUME, Vec::new())
            .await
    }

    pub async fn vm_exit(&self, exit_code: i32) -> Result<()> {
        let mut w = DwpWriter::new();
        w.write_i32(exit_code);
        self.query_unit(command_set::VM, vm::EXIT, w.into_vec()).await
    }

    pub async fn types_for_source_file(
        &self,
        file: &str,
        ignore_case: bool,
    ) -> Result<Vec<TypeId>> {
        let mut w = DwpWriter::new();
        w.write_string(file);
        w.write_bool(ignore_case);
        let payload = self
            .request(command_set::VM, vm::GET_TYPES_FOR_SOURCE_FILE, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_ids()
    }

    pub async fn types_by_name(&self, name: &str, ignore_case: bool) -> Result<Vec<TypeId>> {
        let mut w = DwpWriter::new();
        w.write_string(name);
        w.write_bool(ignore_case);
        let payload = self
            .request(command_set::VM, vm::GET_TYPES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_ids()
    }

    // --- OBJECT_REF -------------------------------------------------------

    pub async fn object_type(&self, object: ObjectId) -> Result<TypeId> {
        let payload = self
            .query_id(command_set::OBJECT_REF, object_ref::GET_TYPE, object)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn object_values(&self, object: ObjectId, fields: &[FieldId]) -> Result<Vec<Value>> {
        let mut w = DwpWriter::new();
        w.write_id(object);
        w.write_ids(fields);
        let payload = self
            .request(command_set::OBJECT_REF, object_ref::GET_VALUES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_n_values(fields.len())
    }

    pub async fn object_set_values(
        &self,
        object: ObjectId,
        fields: &[FieldId],
        values: &[Value],
    ) -> Result<()> {
        if fields.len() != values.len() {
            return Err(DwpError::InvalidState("field and value counts differ"));
        }
        let mut w = DwpWriter::new();
        w.write_id(object);
        w.write_i32(fields.len() as i32);
        for (field, value) in fields.iter().zip(values) {
            w.write_id(*field);
            w.write_value(value);
        }
        self.query_unit(command_set::OBJECT_REF, object_ref::SET_VALUES, w.into_vec())
            .await
    }

    pub async fn object_is_collected(&self, object: ObjectId) -> Result<bool> {
        let payload = self
            .query_id(command_set::OBJECT_REF, object_ref::IS_COLLECTED, object)
            .await?;
        Ok(DwpReader::new(&payload).read_i32()? != 0)
    }

    pub async fn object_address(&self, object: ObjectId) -> Result<u64> {
        let payload = self
            .query_id(command_set::OBJECT_REF, object_ref::GET_ADDRESS, object)
            .await?;
        DwpReader::new(&payload).read_u64()
    }

    pub async fn object_domain(&self, object: ObjectId) -> Result<DomainId> {
        let payload = self
            .query_id(command_set::OBJECT_REF, object_ref::GET_DOMAIN, object)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    /// Type and domain in one round trip.
    pub async fn object_info(&self, object: ObjectId) -> Result<ObjectInfo> {
        self.require(Feature::ObjectInfo)?;
        let payload = self
            .query_id(command_set::OBJECT_REF, object_ref::GET_INFO, object)
            .await?;
        let mut r = DwpReader::new(&payload);
        Ok(ObjectInfo {
            type_id: r.read_id()?,
            domain_id: r.read_id()?,
        })
    }

    // --- STRING_REF -------------------------------------------------------

    pub async fn string_value(&self, string: ObjectId) -> Result<String> {
        let payload = self
            .query_id(command_set::STRING_REF, string_ref::GET_VALUE, string)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    pub async fn string_length(&self, string: ObjectId) -> Result<i64> {
        let payload = self
            .query_id(command_set::STRING_REF, string_ref::GET_LENGTH, string)
            .await?;
        DwpReader::new(&payload).read_i64()
    }

    pub async fn string_chars(&self, string: ObjectId, index: i64, length: i64) -> Result<String> {
        let mut w = DwpWriter::new();
        w.write_id(string);
        w.write_i64(index);
        w.write_i64(length);
        let payload = self
            .request(command_set::STRING_REF, string_ref::GET_CHARS, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_utf16_string()
    }

    // --- THREAD -----------------------------------------------------------

    /// Frames of a suspended thread; `length == -1` requests all remaining.
    pub async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self
            .request(command_set::THREAD, thread::GET_FRAME_INFO, w.into_vec())
            .await?;
        let mut r = DwpReader::new(&payload);
        let count = r.read_count()?;
        let mut frames = Vec::with_capacity(count.min(r.remaining() / 13));
        for _ in 0..count {
            frames.push(FrameInfo {
                frame_id: r.read_id()?,
                method_id: r.read_id()?,
                il_offset: r.read_i32()?,
                flags: r.read_u8()?,
            });
        }
        Ok(frames)
    }

    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let payload = self
            .query_id(command_set::THREAD, thread::GET_NAME, thread)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    pub async fn thread_state(&self, thread: ThreadId) -> Result<i32> {
        let payload = self
            .query_id(command_set::THREAD, thread::GET_STATE, thread)
            .await?;
        DwpReader::new(&payload).read_i32()
    }

    pub async fn thread_info(&self, thread: ThreadId) -> Result<ThreadInfo> {
        let payload = self
            .query_id(command_set::THREAD, thread::GET_INFO, thread)
            .await?;
        Ok(ThreadInfo {
            is_thread_pool: DwpReader::new(&payload).read_bool()?,
        })
    }

    /// Managed thread id.
    pub async fn thread_managed_id(&self, thread: ThreadId) -> Result<i64> {
        let payload = self
            .query_id(command_set::THREAD, thread::GET_ID, thread)
            .await?;
        DwpReader::new(&payload).read_i64()
    }

    /// OS thread id.
    pub async fn thread_tid(&self, thread: ThreadId) -> Result<i64> {
        let payload = self
            .query_id(command_set::THREAD, thread::GET_TID, thread)
            .await?;
        DwpReader::new(&payload).read_i64()
    }

    // --- ARRAY_REF --------------------------------------------------------

    pub async fn array_bounds(&self, array: ObjectId) -> Result<ArrayBounds> {
        let payload = self
            .query_id(command_set::ARRAY_REF, array_ref::GET_LENGTH, array)
            .await?;
        let mut r = DwpReader::new(&payload);
        let rank = r.read_count()?;
        let mut dimensions = Vec::with_capacity(rank.min(r.remaining() / 8));
        for _ in 0..rank {
            dimensions.push((r.read_i32()?, r.read_i32()?));
        }
        Ok(ArrayBounds { dimensions })
    }

    pub async fn array_values(
        &self,
        array: ObjectId,
        index: i32,
        length: i32,
    ) -> Result<Vec<Value>> {
        let mut w = DwpWriter::new();
        w.write_id(array);
        w.write_i32(index);
        w.write_i32(length);
        let payload = self
            .request(command_set::ARRAY_REF, array_ref::GET_VALUES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_n_values(length.max(0) as usize)
    }

    pub async fn array_set_values(
        &self,
        array: ObjectId,
        index: i32,
        values: &[Value],
    ) -> Result<()> {
        let mut w = DwpWriter::new();
        w.write_id(array);
        w.write_i32(index);
        w.write_values(values);
        self.query_unit(command_set::ARRAY_REF, array_ref::SET_VALUES, w.into_vec())
            .await
    }

    // --- STACK_FRAME ------------------------------------------------------

    /// Locals (positive positions) and arguments (negative positions) of a frame.
    pub async fn frame_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        positions: &[i32],
    ) -> Result<Vec<Value>> {
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_id(frame);
        w.write_i32(positions.len() as i32);
        for pos in positions {
            w.write_i32(*pos);
        }
        let payload = self
            .request(command_set::STACK_FRAME, stack_frame::GET_VALUES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_n_values(positions.len())
    }

    pub async fn frame_this(&self, thread: ThreadId, frame: FrameId) -> Result<Value> {
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_id(frame);
        let payload = self
            .request(command_set::STACK_FRAME, stack_frame::GET_THIS, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_value()
    }

    pub async fn frame_set_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        positions: &[i32],
        values: &[Value],
    ) -> Result<()> {
        if positions.len() != values.len() {
            return Err(DwpError::InvalidState("position and value counts differ"));
        }
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_id(frame);
        w.write_i32(positions.len() as i32);
        for pos in positions {
            w.write_i32(*pos);
        }
        for value in values {
            w.write_value(value);
        }
        self.query_unit(command_set::STACK_FRAME, stack_frame::SET_VALUES, w.into_vec())
            .await
    }

    // --- APPDOMAIN --------------------------------------------------------

    pub async fn root_domain(&self) -> Result<DomainId> {
        let payload = self
            .request(command_set::APPDOMAIN, appdomain::GET_ROOT_DOMAIN, Vec::new())
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn domain_friendly_name(&self, domain: DomainId) -> Result<String> {
        let payload = self
            .query_id(command_set::APPDOMAIN, appdomain::GET_FRIENDLY_NAME, domain)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    pub async fn domain_assemblies(&self, domain: DomainId) -> Result<Vec<AssemblyId>> {
        let payload = self
            .query_id(command_set::APPDOMAIN, appdomain::GET_ASSEMBLIES, domain)
            .await?;
        DwpReader::new(&payload).read_ids()
    }

    pub async fn domain_entry_assembly(&self, domain: DomainId) -> Result<AssemblyId> {
        let payload = self
            .query_id(command_set::APPDOMAIN, appdomain::GET_ENTRY_ASSEMBLY, domain)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn domain_corlib(&self, domain: DomainId) -> Result<AssemblyId> {
        let payload = self
            .query_id(command_set::APPDOMAIN, appdomain::GET_CORLIB, domain)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn domain_create_string(&self, domain: DomainId, value: &str) -> Result<ObjectId> {
        let mut w = DwpWriter::new();
        w.write_id(domain);
        w.write_string(value);
        let payload = self
            .request(command_set::APPDOMAIN, appdomain::CREATE_STRING, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn domain_create_boxed_value(
        &self,
        domain: DomainId,
        type_id: TypeId,
        value: &Value,
    ) -> Result<ObjectId> {
        let mut w = DwpWriter::new();
        w.write_id(domain);
        w.write_id(type_id);
        w.write_value(value);
        let payload = self
            .request(command_set::APPDOMAIN, appdomain::CREATE_BOXED_VALUE, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_id()
    }

    // --- ASSEMBLY ---------------------------------------------------------

    pub async fn assembly_location(&self, assembly: AssemblyId) -> Result<String> {
        let payload = self
            .query_id(command_set::ASSEMBLY, assembly::GET_LOCATION, assembly)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    /// Entry-point method, `0` if the assembly has none.
    pub async fn assembly_entry_point(&self, assembly: AssemblyId) -> Result<MethodId> {
        let payload = self
            .query_id(command_set::ASSEMBLY, assembly::GET_ENTRY_POINT, assembly)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn assembly_manifest_module(&self, assembly: AssemblyId) -> Result<ModuleId> {
        let payload = self
            .query_id(command_set::ASSEMBLY, assembly::GET_MANIFEST_MODULE, assembly)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn assembly_object(&self, assembly: AssemblyId) -> Result<ObjectId> {
        let payload = self
            .query_id(command_set::ASSEMBLY, assembly::GET_OBJECT, assembly)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn assembly_type(
        &self,
        assembly: AssemblyId,
        name: &str,
        ignore_case: bool,
    ) -> Result<TypeId> {
        let mut w = DwpWriter::new();
        w.write_id(assembly);
        w.write_string(name);
        w.write_bool(ignore_case);
        let payload = self
            .request(command_set::ASSEMBLY, assembly::GET_TYPE, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn assembly_name(&self, assembly: AssemblyId) -> Result<String> {
        let payload = self
            .query_id(command_set::ASSEMBLY, assembly::GET_NAME, assembly)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    // --- METHOD -----------------------------------------------------------

    pub async fn method_name(&self, method: MethodId) -> Result<String> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_NAME, method)
            .await?;
        DwpReader::new(&payload).read_string()
    }

    pub async fn method_declaring_type(&self, method: MethodId) -> Result<TypeId> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_DECLARING_TYPE, method)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn method_debug_info(&self, method: MethodId) -> Result<MethodDebugInfo> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_DEBUG_INFO, method)
            .await?;
        decode_method_debug_info(&payload, self.version())
    }

    pub async fn method_param_info(&self, method: MethodId) -> Result<ParamInfo> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_PARAM_INFO, method)
            .await?;
        let mut r = DwpReader::new(&payload);
        let call_convention = r.read_i32()?;
        let param_count = r.read_count()?;
        let generic_param_count = r.read_i32()?;
        let return_type = r.read_id()?;
        let mut param_types = Vec::with_capacity(param_count.min(r.remaining() / 4));
        for _ in 0..param_count {
            param_types.push(r.read_id()?);
        }
        let mut param_names = Vec::with_capacity(param_types.len());
        for _ in 0..param_count {
            param_names.push(r.read_string()?);
        }
        Ok(ParamInfo {
            call_convention,
            generic_param_count,
            return_type,
            param_types,
            param_names,
        })
    }

    pub async fn method_locals_info(&self, method: MethodId) -> Result<Vec<LocalInfo>> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_LOCALS_INFO, method)
            .await?;
        decode_locals_info(&payload)
    }

    pub async fn method_info(&self, method: MethodId) -> Result<MethodInfo> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_INFO, method)
            .await?;
        let mut r = DwpReader::new(&payload);
        Ok(MethodInfo {
            attributes: r.read_i32()?,
            impl_attributes: r.read_i32()?,
            token: r.read_i32()?,
        })
    }

    /// Raw IL bytes.
    pub async fn method_body(&self, method: MethodId) -> Result<Vec<u8>> {
        let payload = self
            .query_id(command_set::METHOD, method::GET_BODY, method)
            .await?;
        DwpReader::new(&payload).read_blob()
    }

    // --- TYPE -------------------------------------------------------------

    pub async fn type_info(&self, type_id: TypeId) -> Result<TypeInfo> {
        let payload = self
            .query_id(command_set::TYPE, type_::GET_INFO, type_id)
            .await?;
        decode_type_info(&payload)
    }

    pub async fn type_methods(&self, type_id: TypeId) -> Result<Vec<MethodId>> {
        let payload = self
            .query_id(command_set::TYPE, type_::GET_METHODS, type_id)
            .await?;
        DwpReader::new(&payload).read_ids()
    }

    pub async fn type_fields(&self, type_id: TypeId) -> Result<Vec<FieldInfo>> {
        let payload = self
            .query_id(command_set::TYPE, type_::GET_FIELDS, type_id)
            .await?;
        let mut r = DwpReader::new(&payload);
        let count = r.read_count()?;
        let mut fields = Vec::with_capacity(count.min(r.remaining() / 16));
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id()?,
                name: r.read_string()?,
                type_id: r.read_id()?,
                attributes: r.read_i32()?,
            });
        }
        Ok(fields)
    }

    /// Static field values.
    pub async fn type_values(&self, type_id: TypeId, fields: &[FieldId]) -> Result<Vec<Value>> {
        let mut w = DwpWriter::new();
        w.write_id(type_id);
        w.write_ids(fields);
        let payload = self
            .request(command_set::TYPE, type_::GET_VALUES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_n_values(fields.len())
    }

    pub async fn type_set_values(
        &self,
        type_id: TypeId,
        fields: &[FieldId],
        values: &[Value],
    ) -> Result<()> {
        if fields.len() != values.len() {
            return Err(DwpError::InvalidState("field and value counts differ"));
        }
        let mut w = DwpWriter::new();
        w.write_id(type_id);
        w.write_i32(fields.len() as i32);
        for (field, value) in fields.iter().zip(values) {
            w.write_id(*field);
            w.write_value(value);
        }
        self.query_unit(command_set::TYPE, type_::SET_VALUES, w.into_vec())
            .await
    }

    /// The `System.Type` object for a type.
    pub async fn type_object(&self, type_id: TypeId) -> Result<ObjectId> {
        let payload = self
            .query_id(command_set::TYPE, type_::GET_OBJECT, type_id)
            .await?;
        DwpReader::new(&payload).read_id()
    }

    pub async fn type_source_files(
        &self,
        type_id: TypeId,
        full_paths: bool,
    ) -> Result<Vec<String>> {
        let mut w = DwpWriter::new();
        w.write_id(type_id);
        w.write_bool(full_paths);
        let payload = self
            .request(command_set::TYPE, type_::GET_SOURCE_FILES, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_strings()
    }

    pub async fn type_is_assignable_from(&self, type_id: TypeId, other: TypeId) -> Result<bool> {
        let mut w = DwpWriter::new();
        w.write_id(type_id);
        w.write_id(other);
        let payload = self
            .request(command_set::TYPE, type_::IS_ASSIGNABLE_FROM, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_bool()
    }

    // --- MODULE / FIELD ---------------------------------------------------

    pub async fn module_info(&self, module: ModuleId) -> Result<ModuleInfo> {
        let payload = self
            .query_id(command_set::MODULE, module::GET_INFO, module)
            .await?;
        let mut r = DwpReader::new(&payload);
        Ok(ModuleInfo {
            name: r.read_string()?,
            scope_name: r.read_string()?,
            fully_qualified_name: r.read_string()?,
            guid: r.read_string()?,
            assembly: r.read_id()?,
        })
    }

    pub async fn field_info(&self, field: FieldId) -> Result<FieldDetails> {
        let payload = self
            .query_id(command_set::FIELD, field::GET_INFO, field)
            .await?;
        let mut r = DwpReader::new(&payload);
        Ok(FieldDetails {
            name: r.read_string()?,
            parent: r.read_id()?,
            type_id: r.read_id()?,
            attributes: r.read_i32()?,
        })
    }
}

const TYPE_FLAG_BYREF: u8 = 0x01;
const TYPE_FLAG_POINTER: u8 = 0x02;
const TYPE_FLAG_PRIMITIVE: u8 = 0x04;
const TYPE_FLAG_VALUETYPE: u8 = 0x08;
const TYPE_FLAG_ENUM: u8 = 0x10;

pub(crate) fn decode_type_info(payload: &[u8]) -> Result<TypeInfo> {
    let mut r = DwpReader::new(payload);
    let namespace = r.read_string()?;
    let name = r.read_string()?;
    let full_name = r.read_string()?;
    let assembly = r.read_id()?;
    let module = r.read_id()?;
    let base_type = r.read_id()?;
    let element_type = r.read_id()?;
    let token = r.read_i32()?;
    let rank = r.read_u8()?;
    let attributes = r.read_i32()?;
    let flags = r.read_u8()?;
    let nested = r.read_ids()?;
    Ok(TypeInfo {
        namespace,
        name,
        full_name,
        assembly,
        module,
        base_type,
        element_type,
        token,
        rank,
        attributes,
        is_byref: flags & TYPE_FLAG_BYREF != 0,
        is_pointer: flags & TYPE_FLAG_POINTER != 0,
        is_primitive: flags & TYPE_FLAG_PRIMITIVE != 0,
        is_valuetype: flags & TYPE_FLAG_VALUETYPE != 0,
        is_enum: flags & TYPE_FLAG_ENUM != 0,
        nested,
    })
}

/// Inverse of [`decode_type_info`]; used by the scripted peer.
#[cfg(any(test, feature = "wire-test-support"))]
pub(crate) fn encode_type_info(w: &mut DwpWriter, info: &TypeInfo) {
    w.write_string(&info.namespace);
    w.write_string(&info.name);
    w.write_string(&info.full_name);
    w.write_id(info.assembly);
    w.write_id(info.module);
    w.write_id(info.base_type);
    w.write_id(info.element_type);
    w.write_i32(info.token);
    w.write_u8(info.rank);
    w.write_i32(info.attributes);
    let mut flags = 0;
    for (set, bit) in [
        (info.is_byref, TYPE_FLAG_BYREF),
        (info.is_pointer, TYPE_FLAG_POINTER),
        (info.is_primitive, TYPE_FLAG_PRIMITIVE),
        (info.is_valuetype, TYPE_FLAG_VALUETYPE),
        (info.is_enum, TYPE_FLAG_ENUM),
    ] {
        if set {
            flags |= bit;
        }
    }
    w.write_u8(flags);
    w.write_ids(&info.nested);
}

fn decode_locals_info(payload: &[u8]) -> Result<Vec<LocalInfo>> {
    let mut r = DwpReader::new(payload);
    let count = r.read_count()?;
    let mut type_ids = Vec::with_capacity(count.min(r.remaining() / 4));
    for _ in 0..count {
        type_ids.push(r.read_id()?);
    }
    let mut names = Vec::with_capacity(type_ids.len());
    for _ in 0..count {
        names.push(r.read_string()?);
    }
    let mut locals = Vec::with_capacity(type_ids.len());
    for (type_id, name) in type_ids.into_iter().zip(names) {
        locals.push(LocalInfo {
            type_id,
            name,
            live_start: r.read_i32()?,
            live_end: r.read_i32()?,
        });
    }
    Ok(locals)
}

/// Decode `METHOD.GET_DEBUG_INFO`; the per-line layout depends on the
/// negotiated version.
///
/// Fields the peer cannot send are `None`. End line and end column default
/// independently of each other.
pub(crate) fn decode_method_debug_info(
    payload: &[u8],
    version: VersionInfo,
) -> Result<MethodDebugInfo> {
    let has_source_table = Feature::MethodSourceTable.is_available(version);
    let has_columns = Feature::MethodLineColumns.is_available(version);
    let has_end = Feature::MethodEndLineColumns.is_available(version);

    let mut r = DwpReader::new(payload);
    let max_il_offset = r.read_i32()?;
    let source_files = if has_source_table {
        r.read_strings()?
    } else {
        vec![r.read_string()?]
    };

    let count = r.read_count()?;
    let mut lines = Vec::with_capacity(count.min(r.remaining() / 8));
    for _ in 0..count {
        let il_offset = r.read_i32()?;
        let line = r.read_i32()?;
        let source_index = if has_source_table {
            read_index(&mut r)?
        } else {
            Some(0)
        };
        let column = if has_columns { Some(r.read_i32()?) } else { None };
        let (end_line, end_column) = if has_end {
            (Some(r.read_i32()?), Some(r.read_i32()?))
        } else {
            (None, None)
        };
        if let Some(index) = source_index {
            if index >= source_files.len() {
                return Err(DwpError::Protocol(format!(
                    "line entry references source {index} of {}",
                    source_files.len()
                )));
            }
        }
        lines.push(LineEntry {
            il_offset,
            line,
            source_index,
            column,
            end_line,
            end_column,
        });
    }

    Ok(MethodDebugInfo {
        max_il_offset,
        source_files,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_info_payload(version: VersionInfo) -> Vec<u8> {
        let mut w = DwpWriter::new();
        w.write_i32(40);
        if Feature::MethodSourceTable.is_available(version) {
            w.write_i32(2);
            w.write_string("a.cs");
            w.write_string("b.cs");
        } else {
            w.write_string("a.cs");
        }
        w.write_i32(2);
        for (il, line, source) in [(0, 10, 0), (12, 11, -1)] {
            w.write_i32(il);
            w.write_i32(line);
            if Feature::MethodSourceTable.is_available(version) {
                w.write_i32(source);
            }
            if Feature::MethodLineColumns.is_available(version) {
                w.write_i32(5);
            }
            if Feature::MethodEndLineColumns.is_available(version) {
                w.write_i32(line);
                w.write_i32(20);
            }
        }
        w.into_vec()
    }

    #[test]
    fn debug_info_on_current_peers_has_every_column() {
        let info =
            decode_method_debug_info(&debug_info_payload(VersionInfo::LOCAL), VersionInfo::LOCAL)
                .unwrap();
        assert_eq!(info.max_il_offset, 40);
        assert_eq!(info.source_files, vec!["a.cs", "b.cs"]);
        assert_eq!(
            info.lines[0],
            LineEntry {
                il_offset: 0,
                line: 10,
                source_index: Some(0),
                column: Some(5),
                end_line: Some(10),
                end_column: Some(20),
            }
        );
        assert_eq!(info.lines[1].source_index, None);
    }

    #[test]
    fn debug_info_on_old_peers_leaves_missing_columns_unset() {
        let version = VersionInfo::new(2, 20);
        let info = decode_method_debug_info(&debug_info_payload(version), version).unwrap();
        assert_eq!(info.lines[0].column, Some(5));
        assert_eq!(info.lines[0].end_line, None);
        assert_eq!(info.lines[0].end_column, None);

        let version = VersionInfo::new(2, 10);
        let info = decode_method_debug_info(&debug_info_payload(version), version).unwrap();
        assert_eq!(info.source_files, vec!["a.cs"]);
        assert_eq!(info.lines[1].source_index, Some(0));
        assert_eq!(info.lines[1].column, None);
    }

    #[test]
    fn type_info_flags_round_trip() {
        let info = TypeInfo {
            namespace: "System".into(),
            name: "Int32".into(),
            full_name: "System.Int32".into(),
            assembly: 1,
            module: 2,
            base_type: 3,
            element_type: 0,
            token: 0x0200_0001,
            rank: 0,
            attributes: 0x2000,
            is_byref: false,
            is_pointer: false,
            is_primitive: true,
            is_valuetype: true,
            is_enum: false,
            nested: vec![7, 8],
        };
        let mut w = DwpWriter::new();
        encode_type_info(&mut w, &info);
        assert_eq!(decode_type_info(&w.into_vec()).unwrap(), info);
    }

    #[test]
    fn locals_info_groups_columns() {
        let mut w = DwpWriter::new();
        w.write_i32(2);
        w.write_id(10);
        w.write_id(11);
        w.write_string("i");
        w.write_string("s");
        w.write_i32(0);
        w.write_i32(5);
        w.write_i32(2);
        w.write_i32(9);
        let locals = decode_locals_info(&w.into_vec()).unwrap();
        assert_eq!(locals[1].name, "s");
        assert_eq!(locals[1].type_id, 11);
        assert_eq!((locals[1].live_start, locals[1].live_end), (2, 9));
    }
}
