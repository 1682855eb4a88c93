//! vSphere Web Services (SOAP) client.

use std::sync::Arc;

use importer_shared::constants::http::USER_AGENT;
use importer_shared::{ImportError, ImportResult};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, SET_COOKIE};
use roxmltree::{Document, Node};
use sha1::{Digest, Sha1};
use tokio::runtime::Runtime;
use url::Url;

use super::{
    DiskChangeExtent, DiskChangeInfo, SnapshotTree, VirtualDisk, VmwareClient, VmwareConnector,
    VmwareParams,
};
use crate::sources::http::build_runtime;
use crate::util::redact_url;

const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SOAP_ACTION: &str = "urn:vim25/6.7";
const SESSION_COOKIE: &str = "vmware_soap_session";
const VCENTER_API: &str = "VirtualCenter";

/// Logs in through the SOAP API.
pub struct SoapVmwareConnector;

impl VmwareConnector for SoapVmwareConnector {
    fn connect(&self, params: &VmwareParams) -> ImportResult<Box<dyn VmwareClient>> {
        Ok(Box::new(SoapVmwareClient::connect(params)?))
    }
}

/// Managed objects every session starts from.
#[derive(Debug, Default, PartialEq, Eq)]
struct ServiceContent {
    root_folder: String,
    property_collector: String,
    search_index: String,
    session_manager: String,
    api_type: String,
}

pub struct SoapVmwareClient {
    runtime: Arc<Runtime>,
    http: reqwest::Client,
    sdk: Url,
    server: String,
    thumbprint: String,
    thumbprint_checked: bool,
    cookie: Option<String>,
    content: ServiceContent,
    moref: String,
    logged_in: bool,
}

impl SoapVmwareClient {
    /// Log in and locate the VM with BIOS UUID `params.uuid`.
    pub fn connect(params: &VmwareParams) -> ImportResult<Self> {
        let (sdk, server) = sdk_url(&params.endpoint)?;
        let runtime = build_runtime("importer-vsphere")?;
        // The endpoint certificate is pinned by thumbprint, not by a CA.
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .tls_info(true)
            .build()
            .map_err(|e| ImportError::Config(format!("Error creating vSphere client: {}", e)))?;

        let mut client = Self {
            runtime,
            http,
            sdk,
            server,
            thumbprint: params.thumbprint.clone(),
            thumbprint_checked: false,
            cookie: None,
            content: ServiceContent::default(),
            moref: String::new(),
            logged_in: false,
        };

        tracing::info!("Connecting to {}", redact_url(client.sdk.as_str()));
        let body = r#"<RetrieveServiceContent xmlns="urn:vim25"><_this type="ServiceInstance">ServiceInstance</_this></RetrieveServiceContent>"#;
        let response = client.call(body)?;
        client.content = parse_service_content(&response)?;

        let login = format!(
            r#"<Login xmlns="urn:vim25"><_this type="SessionManager">{}</_this><userName>{}</userName><password>{}</password></Login>"#,
            escape(&client.content.session_manager),
            escape(&params.username),
            escape(&params.password)
        );
        client
            .call(&login)
            .map_err(|e| e.context("Unable to connect to vCenter"))?;
        client.logged_in = true;

        client.moref = client.find_vm(&params.uuid)?;
        let moref = client.moref.clone();
        match client.retrieve_property("VirtualMachine", &moref, "runtime.powerState") {
            Ok(xml) => match property_text(&xml) {
                Ok(Some(state)) => tracing::info!("Current VM power state: {}", state),
                _ => tracing::warn!("Unable to get current VM power state"),
            },
            Err(e) => tracing::warn!("Unable to get current VM power state: {}", e),
        }
        Ok(client)
    }

    fn call(&mut self, body: &str) -> ImportResult<String> {
        let envelope = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
                r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="{}">"#,
                r#"<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#
            ),
            XSI_NS, body
        );
        let mut request = self
            .http
            .post(self.sdk.clone())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope);
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie.as_str());
        }

        let resp = self
            .runtime
            .block_on(request.send())
            .map_err(|e| ImportError::Network(format!("vSphere request failed: {}", e)))?;
        if !self.thumbprint_checked {
            self.thumbprint_checked = true;
            let peer = resp
                .extensions()
                .get::<reqwest::tls::TlsInfo>()
                .and_then(|info| info.peer_certificate())
                .map(thumbprint);
            match peer {
                Some(seen) if !self.thumbprint.is_empty() && !seen.eq_ignore_ascii_case(&self.thumbprint) => {
                    tracing::warn!(expected = %self.thumbprint, seen = %seen, "Endpoint certificate thumbprint differs");
                }
                Some(seen) => tracing::debug!(thumbprint = %seen, "Endpoint certificate"),
                None => {}
            }
        }
        if let Some(cookie) = session_cookie(resp.headers()) {
            self.cookie = Some(cookie);
        }

        let status = resp.status();
        let text = self
            .runtime
            .block_on(resp.text())
            .map_err(|e| ImportError::Network(format!("vSphere response unreadable: {}", e)))?;
        if !status.is_success() {
            let reason = fault_string(&text).unwrap_or_else(|| status.to_string());
            return Err(ImportError::Network(format!("vSphere request failed: {}", reason)));
        }
        Ok(text)
    }

    fn retrieve_property(&mut self, kind: &str, moref: &str, path: &str) -> ImportResult<String> {
        let body = format!(
            concat!(
                r#"<RetrievePropertiesEx xmlns="urn:vim25"><_this type="PropertyCollector">{pc}</_this>"#,
                r#"<specSet><propSet><type>{kind}</type><pathSet>{path}</pathSet></propSet>"#,
                r#"<objectSet><obj type="{kind}">{obj}</obj><skip>false</skip></objectSet></specSet>"#,
                r#"<options/></RetrievePropertiesEx>"#
            ),
            pc = escape(&self.content.property_collector),
            kind = kind,
            path = path,
            obj = escape(moref)
        );
        self.call(&body)
    }

    fn datacenters(&mut self) -> ImportResult<Vec<String>> {
        let body = format!(
            concat!(
                r#"<RetrievePropertiesEx xmlns="urn:vim25"><_this type="PropertyCollector">{pc}</_this>"#,
                r#"<specSet><propSet><type>Datacenter</type><pathSet>name</pathSet></propSet>"#,
                r#"<objectSet><obj type="Folder">{root}</obj><skip>true</skip>"#,
                r#"<selectSet xsi:type="TraversalSpec"><name>visitFolders</name><type>Folder</type>"#,
                r#"<path>childEntity</path><skip>false</skip><selectSet><name>visitFolders</name></selectSet>"#,
                r#"</selectSet></objectSet></specSet><options/></RetrievePropertiesEx>"#
            ),
            pc = escape(&self.content.property_collector),
            root = escape(&self.content.root_folder)
        );
        let xml = self.call(&body)?;
        parse_object_refs(&xml)
    }

    fn find_vm(&mut self, uuid: &str) -> ImportResult<String> {
        let datacenters = self
            .datacenters()
            .map_err(|e| e.context("Unable to retrieve datacenter list"))?;
        for datacenter in datacenters {
            let body = format!(
                concat!(
                    r#"<FindByUuid xmlns="urn:vim25"><_this type="SearchIndex">{}</_this>"#,
                    r#"<datacenter type="Datacenter">{}</datacenter><uuid>{}</uuid>"#,
                    r#"<vmSearch>true</vmSearch><instanceUuid>false</instanceUuid></FindByUuid>"#
                ),
                escape(&self.content.search_index),
                escape(&datacenter),
                escape(uuid)
            );
            match self.call(&body).and_then(|xml| parse_return_text(&xml)) {
                Ok(Some(moref)) => {
                    tracing::info!("VM {} found in datacenter {}: {}", uuid, datacenter, moref);
                    return Ok(moref);
                }
                Ok(None) => tracing::info!("VM {} not found in datacenter {}.", uuid, datacenter),
                Err(e) => tracing::info!("VM {} not found in datacenter {}: {}", uuid, datacenter, e),
            }
        }
        Err(ImportError::VmNotFound(uuid.to_string()))
    }
}

impl VmwareClient for SoapVmwareClient {
    fn moref(&self) -> &str {
        &self.moref
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn is_vcenter(&self) -> bool {
        self.content.api_type == VCENTER_API
    }

    fn disks(&mut self, snapshot: Option<&str>) -> ImportResult<Vec<VirtualDisk>> {
        let xml = match snapshot {
            Some(snapshot) => self.retrieve_property("VirtualMachineSnapshot", snapshot, "config.hardware.device")?,
            None => {
                let moref = self.moref.clone();
                self.retrieve_property("VirtualMachine", &moref, "config.hardware.device")?
            }
        };
        parse_disks(&xml)
    }

    fn snapshots(&mut self) -> ImportResult<Vec<SnapshotTree>> {
        let moref = self.moref.clone();
        let xml = self.retrieve_property("VirtualMachine", &moref, "snapshot")?;
        parse_snapshot_tree(&xml)
    }

    fn query_changed_disk_areas(
        &mut self,
        snapshot: &str,
        device_key: i32,
        start_offset: i64,
        change_id: &str,
    ) -> ImportResult<DiskChangeInfo> {
        let body = format!(
            concat!(
                r#"<QueryChangedDiskAreas xmlns="urn:vim25"><_this type="VirtualMachine">{}</_this>"#,
                r#"<snapshot type="VirtualMachineSnapshot">{}</snapshot><deviceKey>{}</deviceKey>"#,
                r#"<startOffset>{}</startOffset><changeId>{}</changeId></QueryChangedDiskAreas>"#
            ),
            escape(&self.moref),
            escape(snapshot),
            device_key,
            start_offset,
            escape(change_id)
        );
        let xml = self
            .call(&body)
            .map_err(|e| e.context("Failed to query changed areas"))?;
        parse_changed_areas(&xml)
    }

    fn logout(&mut self) -> ImportResult<()> {
        if !self.logged_in {
            return Ok(());
        }
        self.logged_in = false;
        let body = format!(
            r#"<Logout xmlns="urn:vim25"><_this type="SessionManager">{}</_this></Logout>"#,
            escape(&self.content.session_manager)
        );
        self.call(&body)?;
        tracing::info!("Logged out of VMware.");
        Ok(())
    }
}

impl Drop for SoapVmwareClient {
    fn drop(&mut self) {
        if let Err(e) = self.logout() {
            tracing::warn!("Failed to log out of VMware: {}", e);
        }
    }
}

/// `https://host[:port]/sdk` for `endpoint`, and the bare host name.
fn sdk_url(endpoint: &str) -> ImportResult<(Url, String)> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| ImportError::InvalidArgument(format!("Unable to parse endpoint {}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ImportError::InvalidArgument(format!("endpoint {} has no host", endpoint)))?
        .to_string();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_path("sdk");
    url.set_query(None);
    url.set_fragment(None);
    Ok((url, host))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// SHA-1 of a DER certificate as `AA:BB:...`.
fn thumbprint(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(SESSION_COOKIE))
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
}

fn document(xml: &str) -> ImportResult<Document<'_>> {
    Document::parse(xml).map_err(|e| ImportError::Network(format!("invalid vSphere response: {}", e)))
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).and_then(|n| n.text()).map(|t| t.trim().to_string())
}

fn children<'a, 'i>(node: Node<'a, 'i>, name: &'a str) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn first_element<'a, 'i>(doc: &'a Document<'i>, name: &str) -> Option<Node<'a, 'i>> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn xsi_type<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.attributes()
        .find(|a| a.name() == "type" && a.namespace() == Some(XSI_NS))
        .map(|a| a.value())
}

fn fault_string(xml: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    first_element(&doc, "faultstring")
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
}

fn parse_service_content(xml: &str) -> ImportResult<ServiceContent> {
    let doc = document(xml)?;
    let content = first_element(&doc, "returnval")
        .ok_or_else(|| ImportError::Network("service content missing from response".into()))?;
    let field = |name: &str| {
        child_text(content, name)
            .ok_or_else(|| ImportError::Network(format!("service content has no {}", name)))
    };
    Ok(ServiceContent {
        root_folder: field("rootFolder")?,
        property_collector: field("propertyCollector")?,
        search_index: field("searchIndex")?,
        session_manager: field("sessionManager")?,
        api_type: child(content, "about")
            .and_then(|about| child_text(about, "apiType"))
            .unwrap_or_default(),
    })
}

fn parse_object_refs(xml: &str) -> ImportResult<Vec<String>> {
    let doc = document(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "objects")
        .filter_map(|n| child_text(n, "obj"))
        .collect())
}

fn parse_return_text(xml: &str) -> ImportResult<Option<String>> {
    let doc = document(xml)?;
    Ok(first_element(&doc, "returnval")
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

fn property_text(xml: &str) -> ImportResult<Option<String>> {
    let doc = document(xml)?;
    Ok(first_element(&doc, "val")
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string()))
}

fn parse_disks(xml: &str) -> ImportResult<Vec<VirtualDisk>> {
    let doc = document(xml)?;
    let Some(val) = first_element(&doc, "val") else {
        return Ok(Vec::new());
    };
    let mut disks = Vec::new();
    for device in val.children().filter(|n| n.is_element()) {
        if xsi_type(device) != Some("VirtualDisk") {
            continue;
        }
        let Some(backing) = child(device, "backing") else {
            continue;
        };
        let capacity = child_text(device, "capacityInBytes")
            .and_then(|v| v.parse::<i64>().ok())
            .or_else(|| {
                child_text(device, "capacityInKB")
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|kb| kb * 1024)
            })
            .unwrap_or_default();
        disks.push(VirtualDisk {
            key: child_text(device, "key")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            file_name: child_text(backing, "fileName").unwrap_or_default(),
            parent_file_name: child(backing, "parent").and_then(|p| child_text(p, "fileName")),
            change_id: child_text(backing, "changeId"),
            capacity_in_bytes: capacity,
            disk_object_id: child_text(device, "diskObjectId").unwrap_or_default(),
        });
    }
    Ok(disks)
}

fn parse_snapshot_node(node: Node<'_, '_>) -> SnapshotTree {
    SnapshotTree {
        moref: child_text(node, "snapshot").unwrap_or_default(),
        name: child_text(node, "name").unwrap_or_default(),
        children: children(node, "childSnapshotList")
            .map(parse_snapshot_node)
            .collect(),
    }
}

fn parse_snapshot_tree(xml: &str) -> ImportResult<Vec<SnapshotTree>> {
    let doc = document(xml)?;
    let Some(val) = first_element(&doc, "val") else {
        return Ok(Vec::new());
    };
    Ok(children(val, "rootSnapshotList")
        .map(parse_snapshot_node)
        .collect())
}

fn parse_changed_areas(xml: &str) -> ImportResult<DiskChangeInfo> {
    let doc = document(xml)?;
    let Some(info) = first_element(&doc, "returnval") else {
        return Ok(DiskChangeInfo::default());
    };
    let number = |node: Node<'_, '_>, name: &str| {
        child_text(node, name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default()
    };
    Ok(DiskChangeInfo {
        start_offset: number(info, "startOffset"),
        length: number(info, "length"),
        changed_area: children(info, "changedArea")
            .map(|area| DiskChangeExtent {
                start: number(area, "start"),
                length: number(area, "length"),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="{}" xmlns:xsd="http://www.w3.org/2001/XMLSchema"><soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#,
            XSI_NS, body
        )
    }

    #[test]
    fn test_sdk_url() {
        let (url, host) = sdk_url("https://user:pw@vcenter.example.com:8443/ui?x=1").unwrap();
        assert_eq!(url.as_str(), "https://vcenter.example.com:8443/sdk");
        assert_eq!(host, "vcenter.example.com");
        assert!(sdk_url("not a url").is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn test_thumbprint_format() {
        let print = thumbprint(b"certificate");
        assert_eq!(print.len(), 59);
        assert_eq!(print.split(':').count(), 20);
        assert!(print.chars().all(|c| c == ':' || (c.is_ascii_hexdigit() && !c.is_ascii_lowercase())));
    }

    #[test]
    fn test_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("vmware_soap_session=\"abc123\"; Path=/; HttpOnly; Secure;"),
        );
        assert_eq!(session_cookie(&headers).unwrap(), "vmware_soap_session=\"abc123\"");
    }

    #[test]
    fn test_parse_service_content() {
        let xml = envelope(
            r#"<RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>
                <rootFolder type="Folder">group-d1</rootFolder>
                <propertyCollector type="PropertyCollector">propertyCollector</propertyCollector>
                <about><name>VMware vCenter Server</name><apiType>VirtualCenter</apiType></about>
                <searchIndex type="SearchIndex">SearchIndex</searchIndex>
                <sessionManager type="SessionManager">SessionManager</sessionManager>
            </returnval></RetrieveServiceContentResponse>"#,
        );
        let content = parse_service_content(&xml).unwrap();
        assert_eq!(content.root_folder, "group-d1");
        assert_eq!(content.search_index, "SearchIndex");
        assert_eq!(content.api_type, VCENTER_API);
    }

    #[test]
    fn test_parse_datacenters_and_uuid_lookup() {
        let xml = envelope(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>
                <objects><obj type="Datacenter">datacenter-3</obj><propSet><name>name</name><val xsi:type="xsd:string">DC1</val></propSet></objects>
                <objects><obj type="Datacenter">datacenter-21</obj><propSet><name>name</name><val xsi:type="xsd:string">DC2</val></propSet></objects>
            </returnval></RetrievePropertiesExResponse>"#,
        );
        assert_eq!(parse_object_refs(&xml).unwrap(), vec!["datacenter-3", "datacenter-21"]);

        let found = envelope(r#"<FindByUuidResponse xmlns="urn:vim25"><returnval type="VirtualMachine">vm-42</returnval></FindByUuidResponse>"#);
        assert_eq!(parse_return_text(&found).unwrap().as_deref(), Some("vm-42"));
        let missing = envelope(r#"<FindByUuidResponse xmlns="urn:vim25"></FindByUuidResponse>"#);
        assert_eq!(parse_return_text(&missing).unwrap(), None);
    }

    #[test]
    fn test_parse_disks() {
        let xml = envelope(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects><obj type="VirtualMachine">vm-42</obj>
            <propSet><name>config.hardware.device</name><val xsi:type="ArrayOfVirtualDevice">
                <VirtualDevice xsi:type="VirtualIDEController"><key>200</key></VirtualDevice>
                <VirtualDevice xsi:type="VirtualDisk"><key>2000</key>
                    <backing xsi:type="VirtualDiskFlatVer2BackingInfo">
                        <fileName>[ds1] vm/vm-000001.vmdk</fileName>
                        <changeId>52 de c0 d9 b9 43 9d 10-61 d5 4c 1b e9 7b 65 63/81</changeId>
                        <parent xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[ds1] vm/vm.vmdk</fileName></parent>
                    </backing>
                    <capacityInKB>8192</capacityInKB>
                    <capacityInBytes>8388608</capacityInBytes>
                    <diskObjectId>1-2000</diskObjectId>
                </VirtualDevice>
            </val></propSet></objects></returnval></RetrievePropertiesExResponse>"#,
        );
        let disks = parse_disks(&xml).unwrap();
        assert_eq!(disks.len(), 1);
        let disk = &disks[0];
        assert_eq!(disk.key, 2000);
        assert_eq!(disk.file_name, "[ds1] vm/vm-000001.vmdk");
        assert_eq!(disk.parent_file_name.as_deref(), Some("[ds1] vm/vm.vmdk"));
        assert_eq!(disk.capacity_in_bytes, 8 << 20);
        assert_eq!(disk.disk_object_id, "1-2000");
        assert!(disk.change_id.as_deref().unwrap().ends_with("/81"));
    }

    #[test]
    fn test_parse_snapshot_tree() {
        let xml = envelope(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects><obj type="VirtualMachine">vm-42</obj>
            <propSet><name>snapshot</name><val xsi:type="VirtualMachineSnapshotInfo">
                <currentSnapshot type="VirtualMachineSnapshot">snapshot-2</currentSnapshot>
                <rootSnapshotList>
                    <snapshot type="VirtualMachineSnapshot">snapshot-1</snapshot><vm type="VirtualMachine">vm-42</vm>
                    <name>checkpoint-1</name>
                    <childSnapshotList>
                        <snapshot type="VirtualMachineSnapshot">snapshot-2</snapshot><name>checkpoint-2</name>
                    </childSnapshotList>
                </rootSnapshotList>
            </val></propSet></objects></returnval></RetrievePropertiesExResponse>"#,
        );
        let tree = parse_snapshot_tree(&xml).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].moref, "snapshot-1");
        assert_eq!(tree[0].children[0].name, "checkpoint-2");

        let none = envelope(r#"<RetrievePropertiesExResponse xmlns="urn:vim25"></RetrievePropertiesExResponse>"#);
        assert!(parse_snapshot_tree(&none).unwrap().is_empty());
    }

    #[test]
    fn test_parse_changed_areas() {
        let xml = envelope(
            r#"<QueryChangedDiskAreasResponse xmlns="urn:vim25"><returnval>
                <startOffset>0</startOffset><length>10737418240</length>
                <changedArea><start>0</start><length>65536</length></changedArea>
                <changedArea><start>1048576</start><length>131072</length></changedArea>
            </returnval></QueryChangedDiskAreasResponse>"#,
        );
        let info = parse_changed_areas(&xml).unwrap();
        assert_eq!(info.length, 10 << 30);
        assert_eq!(
            info.changed_area,
            vec![
                DiskChangeExtent { start: 0, length: 65536 },
                DiskChangeExtent { start: 1 << 20, length: 128 << 10 },
            ]
        );
    }

    #[test]
    fn test_fault_string() {
        let xml = envelope(
            r#"<soapenv:Fault><faultcode>ServerFaultCode</faultcode><faultstring>Cannot complete login due to an incorrect user name or password.</faultstring></soapenv:Fault>"#,
        );
        assert!(fault_string(&xml).unwrap().starts_with("Cannot complete login"));
        assert_eq!(fault_string("not xml"), None);
    }
}
